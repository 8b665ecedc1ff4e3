//! Race commands.
//!
//! `AcCmdCR` commands are serverbound, `AcCmdRC` clientbound; the
//! `AcCmdUserRace`/`AcCmdGameRace` families mirror the client's own naming
//! for in-race traffic. A few targeting commands travel in both directions
//! and implement both codec traits.

use bytes::Bytes;
use bytes::BytesMut;

use crate::common::{GameMode, HurdleClearType, Oid, Racer, TeamColor, Uid};
use crate::id;
use crate::wire;
use crate::ClientCommand;
use crate::ProtoError;
use crate::ServerCommand;

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCREnterRoom {
    pub character_uid: Uid,
    pub one_time_password: u32,
    pub room_uid: Uid,
}

impl ClientCommand for AcCmdCREnterRoom {
    const ID: u16 = id::CR_ENTER_ROOM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
            one_time_password: wire::get_u32(buf)?,
            room_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomDescription {
    pub name: String,
    pub password: String,
    pub max_player_count: u8,
    pub game_mode: u8,
    pub team_mode: u8,
    pub map_block_id: u16,
    pub mission_id: u16,
    pub npc_race: bool,
    pub skill_bracket: u8,
}

impl RoomDescription {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_string(out, &self.name);
        wire::put_string(out, &self.password);
        wire::put_u8(out, self.max_player_count);
        wire::put_u8(out, self.game_mode);
        wire::put_u8(out, self.team_mode);
        wire::put_u16(out, self.map_block_id);
        wire::put_u16(out, self.mission_id);
        wire::put_bool(out, self.npc_race);
        wire::put_u8(out, self.skill_bracket);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCREnterRoomOK {
    pub room_uid: Uid,
    pub is_room_waiting: bool,
    pub description: RoomDescription,
    pub racers: Vec<Racer>,
}

impl ServerCommand for AcCmdCREnterRoomOK {
    const ID: u16 = id::RC_ENTER_ROOM_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.room_uid);
        wire::put_bool(out, self.is_room_waiting);
        self.description.encode(out);
        wire::put_list(out, &self.racers, |o, r| r.encode(o));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCREnterRoomCancel;

impl ServerCommand for AcCmdCREnterRoomCancel {
    const ID: u16 = id::RC_ENTER_ROOM_CANCEL;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCREnterRoomNotify {
    pub racer: Racer,
    pub average_time_record: u32,
}

impl ServerCommand for AcCmdCREnterRoomNotify {
    const ID: u16 = id::RC_ENTER_ROOM_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        self.racer.encode(out);
        wire::put_u32(out, self.average_time_record);
    }
}

/// Which fields of [`AcCmdCRChangeRoomOptions`] are meaningful.
pub mod room_option {
    pub const NAME: u16 = 1 << 0;
    pub const PLAYER_COUNT: u16 = 1 << 1;
    pub const PASSWORD: u16 = 1 << 2;
    pub const GAME_MODE: u16 = 1 << 3;
    pub const MAP_BLOCK_ID: u16 = 1 << 4;
    pub const NPC_RACE: u16 = 1 << 5;
}

#[derive(Debug, Clone)]
pub struct AcCmdCRChangeRoomOptions {
    pub options_bitfield: u16,
    pub name: String,
    pub player_count: u8,
    pub password: String,
    pub game_mode: GameMode,
    pub map_block_id: u16,
    pub npc_race: bool,
}

impl ClientCommand for AcCmdCRChangeRoomOptions {
    const ID: u16 = id::CR_CHANGE_ROOM_OPTIONS;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            options_bitfield: wire::get_u16(buf)?,
            name: wire::get_string(buf)?,
            player_count: wire::get_u8(buf)?,
            password: wire::get_string(buf)?,
            game_mode: GameMode::decode(buf)?,
            map_block_id: wire::get_u16(buf)?,
            npc_race: wire::get_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRChangeRoomOptionsNotify {
    pub options_bitfield: u16,
    pub name: String,
    pub player_count: u8,
    pub password: String,
    pub game_mode: GameMode,
    pub map_block_id: u16,
    pub npc_race: bool,
}

impl ServerCommand for AcCmdCRChangeRoomOptionsNotify {
    const ID: u16 = id::RC_CHANGE_ROOM_OPTIONS_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.options_bitfield);
        wire::put_string(out, &self.name);
        wire::put_u8(out, self.player_count);
        wire::put_string(out, &self.password);
        self.game_mode.encode(out);
        wire::put_u16(out, self.map_block_id);
        wire::put_bool(out, self.npc_race);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeTeam {
    pub character_oid: Oid,
    pub team_color: TeamColor,
}

impl ClientCommand for AcCmdCRChangeTeam {
    const ID: u16 = id::CR_CHANGE_TEAM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            team_color: TeamColor::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeTeamOK {
    pub character_oid: Oid,
    pub team_color: TeamColor,
}

impl ServerCommand for AcCmdCRChangeTeamOK {
    const ID: u16 = id::RC_CHANGE_TEAM_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        self.team_color.encode(out);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeTeamNotify {
    pub character_oid: Oid,
    pub team_color: TeamColor,
}

impl ServerCommand for AcCmdCRChangeTeamNotify {
    const ID: u16 = id::RC_CHANGE_TEAM_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        self.team_color.encode(out);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLeaveRoom;

impl ClientCommand for AcCmdCRLeaveRoom {
    const ID: u16 = id::CR_LEAVE_ROOM;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRLeaveRoomOK;

impl ServerCommand for AcCmdCRLeaveRoomOK {
    const ID: u16 = id::RC_LEAVE_ROOM_OK;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLeaveRoomNotify {
    pub character_uid: Uid,
}

impl ServerCommand for AcCmdCRLeaveRoomNotify {
    const ID: u16 = id::RC_LEAVE_ROOM_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeMasterNotify {
    pub master_uid: Uid,
}

impl ServerCommand for AcCmdCRChangeMasterNotify {
    const ID: u16 = id::RC_CHANGE_MASTER_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.master_uid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRReadyRace;

impl ClientCommand for AcCmdCRReadyRace {
    const ID: u16 = id::CR_READY_RACE;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRReadyRaceNotify {
    pub character_uid: Uid,
    pub is_ready: bool,
}

impl ServerCommand for AcCmdCRReadyRaceNotify {
    const ID: u16 = id::RC_READY_RACE_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_bool(out, self.is_ready);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRStartRace;

impl ClientCommand for AcCmdCRStartRace {
    const ID: u16 = id::CR_START_RACE;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdRCRoomCountdown {
    pub countdown_ms: u32,
    pub map_block_id: u16,
}

impl ServerCommand for AcCmdRCRoomCountdown {
    const ID: u16 = id::RC_ROOM_COUNTDOWN;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.countdown_ms);
        wire::put_u16(out, self.map_block_id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartRacePlayer {
    pub oid: Oid,
    pub name: String,
    pub p2p_id: u16,
    pub team_color: TeamColor,
}

impl StartRacePlayer {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.oid);
        wire::put_string(out, &self.name);
        wire::put_u16(out, self.p2p_id);
        self.team_color.encode(out);
    }
}

/// The racer's confirmed loadout for the race: the active preset's two
/// slots plus a per-racer bonus skill.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveSkillSet {
    pub set_id: u8,
    pub skills: [u32; 3],
}

impl ActiveSkillSet {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.set_id);
        for skill in self.skills {
            wire::put_u32(out, skill);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCRStartRaceNotify {
    pub game_mode: u8,
    pub team_mode: u8,
    pub map_block_id: u16,
    pub mission_id: u16,
    pub host_oid: Oid,
    pub p2p_relay_address: u32,
    pub p2p_relay_port: u16,
    pub racers: Vec<StartRacePlayer>,
    pub active_skill_set: Option<ActiveSkillSet>,
}

impl ServerCommand for AcCmdCRStartRaceNotify {
    const ID: u16 = id::RC_START_RACE_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.game_mode);
        wire::put_u8(out, self.team_mode);
        wire::put_u16(out, self.map_block_id);
        wire::put_u16(out, self.mission_id);
        wire::put_u16(out, self.host_oid);
        wire::put_u32(out, self.p2p_relay_address);
        wire::put_u16(out, self.p2p_relay_port);
        wire::put_list(out, &self.racers, |o, r| r.encode(o));
        match &self.active_skill_set {
            Some(set) => {
                wire::put_bool(out, true);
                set.encode(out);
            }
            None => wire::put_bool(out, false),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLoadingComplete;

impl ClientCommand for AcCmdCRLoadingComplete {
    const ID: u16 = id::CR_LOADING_COMPLETE;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLoadingCompleteNotify {
    pub oid: Oid,
}

impl ServerCommand for AcCmdCRLoadingCompleteNotify {
    const ID: u16 = id::RC_LOADING_COMPLETE_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.oid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceTimer {
    pub client_clock: u64,
}

impl ClientCommand for AcCmdUserRaceTimer {
    const ID: u16 = id::USER_RACE_TIMER;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            client_clock: wire::get_u64(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceTimerOK {
    pub client_clock: u64,
    pub server_clock: u64,
}

impl ServerCommand for AcCmdUserRaceTimerOK {
    const ID: u16 = id::USER_RACE_TIMER_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u64(out, self.client_clock);
        wire::put_u64(out, self.server_clock);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceCountdown {
    pub race_start_timestamp: u64,
}

impl ServerCommand for AcCmdUserRaceCountdown {
    const ID: u16 = id::USER_RACE_COUNTDOWN;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u64(out, self.race_start_timestamp);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceUpdatePos {
    pub oid: Oid,
    pub position: [f32; 3],
    pub heading: f32,
}

impl ClientCommand for AcCmdUserRaceUpdatePos {
    const ID: u16 = id::USER_RACE_UPDATE_POS;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            oid: wire::get_u16(buf)?,
            position: wire::get_vec3(buf)?,
            heading: wire::get_f32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceFinal {
    pub oid: Oid,
    pub course_time: u32,
}

impl ClientCommand for AcCmdUserRaceFinal {
    const ID: u16 = id::USER_RACE_FINAL;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            oid: wire::get_u16(buf)?,
            course_time: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdUserRaceFinalNotify {
    pub oid: Oid,
    pub course_time: u32,
}

impl ServerCommand for AcCmdUserRaceFinalNotify {
    const ID: u16 = id::USER_RACE_FINAL_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.oid);
        wire::put_u32(out, self.course_time);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRaceResult;

impl ClientCommand for AcCmdCRRaceResult {
    const ID: u16 = id::CR_RACE_RESULT;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRRaceResultOK {
    pub current_carrots: u32,
}

impl ServerCommand for AcCmdCRRaceResultOK {
    const ID: u16 = id::RC_RACE_RESULT_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.current_carrots);
    }
}

pub mod score_flag {
    pub const CONNECTED: u8 = 1 << 0;
}

#[derive(Debug, Clone, Default)]
pub struct ScoreInfo {
    pub uid: Uid,
    pub name: String,
    pub level: u16,
    pub mount_name: String,
    pub course_time: u32,
    pub flags: u8,
}

impl ScoreInfo {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u16(out, self.level);
        wire::put_string(out, &self.mount_name);
        wire::put_u32(out, self.course_time);
        wire::put_u8(out, self.flags);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdRCRaceResultNotify {
    pub scores: Vec<ScoreInfo>,
}

impl ServerCommand for AcCmdRCRaceResultNotify {
    const ID: u16 = id::RC_RACE_RESULT_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_list(out, &self.scores, |o, s| s.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRP2PResult;

impl ClientCommand for AcCmdCRP2PResult {
    const ID: u16 = id::CR_P2P_RESULT;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdGameRaceP2PResult {
    pub oids: Vec<Oid>,
}

impl ServerCommand for AcCmdGameRaceP2PResult {
    const ID: u16 = id::GAME_RACE_P2P_RESULT;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_list(out, &self.oids, |o, oid| wire::put_u16(o, *oid));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceP2PResult;

impl ClientCommand for AcCmdUserRaceP2PResult {
    const ID: u16 = id::USER_RACE_P2P_RESULT;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRAwardStart {
    pub award_id: u32,
}

impl ClientCommand for AcCmdCRAwardStart {
    const ID: u16 = id::CR_AWARD_START;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            award_id: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdRCAwardNotify {
    pub award_id: u32,
}

impl ServerCommand for AcCmdRCAwardNotify {
    const ID: u16 = id::RC_AWARD_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.award_id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRAwardEnd;

impl ClientCommand for AcCmdCRAwardEnd {
    const ID: u16 = id::CR_AWARD_END;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRStarPointGet {
    pub character_oid: Oid,
    pub gained_star_points: u32,
}

impl ClientCommand for AcCmdCRStarPointGet {
    const ID: u16 = id::CR_STAR_POINT_GET;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            gained_star_points: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRStarPointGetOK {
    pub character_oid: Oid,
    pub star_point_value: u32,
    pub give_magic_item: bool,
}

impl ServerCommand for AcCmdCRStarPointGetOK {
    const ID: u16 = id::RC_STAR_POINT_GET_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        wire::put_u32(out, self.star_point_value);
        wire::put_bool(out, self.give_magic_item);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRequestSpur {
    pub character_oid: Oid,
    pub active_boosters: u8,
    pub combo_break: u8,
}

impl ClientCommand for AcCmdCRRequestSpur {
    const ID: u16 = id::CR_REQUEST_SPUR;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            active_boosters: wire::get_u8(buf)?,
            combo_break: wire::get_u8(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRRequestSpurOK {
    pub character_oid: Oid,
    pub active_boosters: u8,
    pub star_point_value: u32,
    pub combo_break: u8,
}

impl ServerCommand for AcCmdCRRequestSpurOK {
    const ID: u16 = id::RC_REQUEST_SPUR_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        wire::put_u8(out, self.active_boosters);
        wire::put_u32(out, self.star_point_value);
        wire::put_u8(out, self.combo_break);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRHurdleClearResult {
    pub character_oid: Oid,
    pub hurdle_clear_type: HurdleClearType,
}

impl ClientCommand for AcCmdCRHurdleClearResult {
    const ID: u16 = id::CR_HURDLE_CLEAR_RESULT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            hurdle_clear_type: HurdleClearType::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRHurdleClearResultOK {
    pub character_oid: Oid,
    pub hurdle_clear_type: HurdleClearType,
    pub jump_combo: u32,
}

impl ServerCommand for AcCmdCRHurdleClearResultOK {
    const ID: u16 = id::RC_HURDLE_CLEAR_RESULT_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        self.hurdle_clear_type.encode(out);
        wire::put_u32(out, self.jump_combo);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRStartingRate {
    pub character_oid: Oid,
    pub velocity: u32,
    pub boost_gained: u32,
}

impl ClientCommand for AcCmdCRStartingRate {
    const ID: u16 = id::CR_STARTING_RATE;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            velocity: wire::get_u32(buf)?,
            boost_gained: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdGameRaceItemSpawn {
    pub item_oid: Oid,
    pub deck_id: u32,
    pub position: [f32; 3],
    pub orientation: [f32; 4],
    pub size_level: bool,
    pub remove_delay: i32,
}

impl ServerCommand for AcCmdGameRaceItemSpawn {
    const ID: u16 = id::GAME_RACE_ITEM_SPAWN;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.item_oid);
        wire::put_u32(out, self.deck_id);
        wire::put_vec3(out, self.position);
        wire::put_vec4(out, self.orientation);
        wire::put_bool(out, self.size_level);
        wire::put_i32(out, self.remove_delay);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceItemGet {
    pub character_oid: Oid,
    pub item_oid: Oid,
}

impl ClientCommand for AcCmdUserRaceItemGet {
    const ID: u16 = id::USER_RACE_ITEM_GET;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            item_oid: wire::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdGameRaceItemGet {
    pub character_oid: Oid,
    pub item_oid: Oid,
    pub deck_id: u32,
}

impl ServerCommand for AcCmdGameRaceItemGet {
    const ID: u16 = id::GAME_RACE_ITEM_GET;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        wire::put_u16(out, self.item_oid);
        wire::put_u32(out, self.deck_id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRequestMagicItem {
    pub character_oid: Oid,
}

impl ClientCommand for AcCmdCRRequestMagicItem {
    const ID: u16 = id::CR_REQUEST_MAGIC_ITEM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRRequestMagicItemOK {
    pub character_oid: Oid,
    pub magic_item_id: u32,
}

impl ServerCommand for AcCmdCRRequestMagicItemOK {
    const ID: u16 = id::RC_REQUEST_MAGIC_ITEM_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        wire::put_u32(out, self.magic_item_id);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRRequestMagicItemNotify {
    pub magic_item_id: u32,
    pub character_oid: Oid,
}

impl ServerCommand for AcCmdCRRequestMagicItemNotify {
    const ID: u16 = id::RC_REQUEST_MAGIC_ITEM_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.magic_item_id);
        wire::put_u16(out, self.character_oid);
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRUseMagicItem {
    pub character_oid: Oid,
    pub magic_item_id: u32,
    pub target_oids: Vec<Oid>,
    pub cast_time: Option<f32>,
    pub effect_duration: Option<f32>,
}

impl ClientCommand for AcCmdCRUseMagicItem {
    const ID: u16 = id::CR_USE_MAGIC_ITEM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        let character_oid = wire::get_u16(buf)?;
        let magic_item_id = wire::get_u32(buf)?;
        let target_oids = wire::get_list(buf, wire::get_u16)?;
        let cast_time = if wire::get_bool(buf)? {
            Some(wire::get_f32(buf)?)
        } else {
            None
        };
        let effect_duration = if wire::get_bool(buf)? {
            Some(wire::get_f32(buf)?)
        } else {
            None
        };
        Ok(Self {
            character_oid,
            magic_item_id,
            target_oids,
            cast_time,
            effect_duration,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCRUseMagicItemOK {
    pub character_oid: Oid,
    pub magic_item_id: u32,
    pub target_oids: Vec<Oid>,
    pub cast_time: Option<f32>,
    pub effect_duration: Option<f32>,
}

fn encode_magic_use(
    out: &mut BytesMut,
    character_oid: Oid,
    magic_item_id: u32,
    target_oids: &[Oid],
    cast_time: Option<f32>,
    effect_duration: Option<f32>,
) {
    wire::put_u16(out, character_oid);
    wire::put_u32(out, magic_item_id);
    wire::put_list(out, target_oids, |o, oid| wire::put_u16(o, *oid));
    match cast_time {
        Some(v) => {
            wire::put_bool(out, true);
            wire::put_f32(out, v);
        }
        None => wire::put_bool(out, false),
    }
    match effect_duration {
        Some(v) => {
            wire::put_bool(out, true);
            wire::put_f32(out, v);
        }
        None => wire::put_bool(out, false),
    }
}

impl ServerCommand for AcCmdCRUseMagicItemOK {
    const ID: u16 = id::RC_USE_MAGIC_ITEM_OK;

    fn encode(&self, out: &mut BytesMut) {
        encode_magic_use(
            out,
            self.character_oid,
            self.magic_item_id,
            &self.target_oids,
            self.cast_time,
            self.effect_duration,
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCRUseMagicItemNotify {
    pub character_oid: Oid,
    pub magic_item_id: u32,
    pub target_oids: Vec<Oid>,
    pub cast_time: Option<f32>,
    pub effect_duration: Option<f32>,
}

impl ServerCommand for AcCmdCRUseMagicItemNotify {
    const ID: u16 = id::RC_USE_MAGIC_ITEM_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        encode_magic_use(
            out,
            self.character_oid,
            self.magic_item_id,
            &self.target_oids,
            self.cast_time,
            self.effect_duration,
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRStartMagicTarget {
    pub character_oid: Oid,
}

impl ClientCommand for AcCmdCRStartMagicTarget {
    const ID: u16 = id::CR_START_MAGIC_TARGET;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeMagicTargetNotify {
    pub character_oid: Oid,
    pub target_oid: Oid,
}

impl ClientCommand for AcCmdCRChangeMagicTargetNotify {
    const ID: u16 = id::CR_CHANGE_MAGIC_TARGET_NOTIFY;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            target_oid: wire::get_u16(buf)?,
        })
    }
}

impl ServerCommand for AcCmdCRChangeMagicTargetNotify {
    const ID: u16 = id::CR_CHANGE_MAGIC_TARGET_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
        wire::put_u16(out, self.target_oid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeMagicTargetOK {
    pub character_oid: Oid,
    pub target_oid: Oid,
}

impl ClientCommand for AcCmdCRChangeMagicTargetOK {
    const ID: u16 = id::CR_CHANGE_MAGIC_TARGET_OK;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
            target_oid: wire::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeMagicTargetCancel {
    pub character_oid: Oid,
}

impl ClientCommand for AcCmdCRChangeMagicTargetCancel {
    const ID: u16 = id::CR_CHANGE_MAGIC_TARGET_CANCEL;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_oid: wire::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdRCRemoveMagicTarget {
    pub character_oid: Oid,
}

impl ServerCommand for AcCmdRCRemoveMagicTarget {
    const ID: u16 = id::RC_REMOVE_MAGIC_TARGET;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.character_oid);
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRChat {
    pub message: String,
}

impl ClientCommand for AcCmdCRChat {
    const ID: u16 = id::CR_CHAT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            message: wire::get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCRChatNotify {
    pub author: String,
    pub message: String,
    pub is_system: bool,
}

impl ServerCommand for AcCmdCRChatNotify {
    const ID: u16 = id::RC_CHAT_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_string(out, &self.author);
        wire::put_string(out, &self.message);
        wire::put_bool(out, self.is_system);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRelayCommand {
    pub kind: u32,
    pub value: u32,
}

impl ClientCommand for AcCmdCRRelayCommand {
    const ID: u16 = id::CR_RELAY_COMMAND;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            kind: wire::get_u32(buf)?,
            value: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRelayCommandNotify {
    pub kind: u32,
    pub value: u32,
}

impl ServerCommand for AcCmdCRRelayCommandNotify {
    const ID: u16 = id::RC_RELAY_COMMAND_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.kind);
        wire::put_u32(out, self.value);
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRRelay {
    pub oid: Oid,
    pub kind: u32,
    pub value: u32,
    pub data: Bytes,
}

impl ClientCommand for AcCmdCRRelay {
    const ID: u16 = id::CR_RELAY;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            oid: wire::get_u16(buf)?,
            kind: wire::get_u32(buf)?,
            value: wire::get_u32(buf)?,
            data: buf.split_off(0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRRelayNotify {
    pub oid: Oid,
    pub kind: u32,
    pub value: u32,
    pub data: Bytes,
}

impl ServerCommand for AcCmdCRRelayNotify {
    const ID: u16 = id::RC_RELAY_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.oid);
        wire::put_u32(out, self.kind);
        wire::put_u32(out, self.value);
        out.extend_from_slice(&self.data);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceActivateInteractiveEvent {
    pub event_id: u32,
    pub character_oid: Oid,
    pub group: u16,
}

impl ClientCommand for AcCmdUserRaceActivateInteractiveEvent {
    const ID: u16 = id::USER_RACE_ACTIVATE_INTERACTIVE_EVENT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            event_id: wire::get_u32(buf)?,
            character_oid: wire::get_u16(buf)?,
            group: wire::get_u16(buf)?,
        })
    }
}

impl ServerCommand for AcCmdUserRaceActivateInteractiveEvent {
    const ID: u16 = id::USER_RACE_ACTIVATE_INTERACTIVE_EVENT;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.event_id);
        wire::put_u16(out, self.character_oid);
        wire::put_u16(out, self.group);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdUserRaceActivateEvent {
    pub event_id: u32,
    pub character_oid: Oid,
}

impl ClientCommand for AcCmdUserRaceActivateEvent {
    const ID: u16 = id::USER_RACE_ACTIVATE_EVENT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            event_id: wire::get_u32(buf)?,
            character_oid: wire::get_u16(buf)?,
        })
    }
}

impl ServerCommand for AcCmdUserRaceActivateEvent {
    const ID: u16 = id::USER_RACE_ACTIVATE_EVENT;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.event_id);
        wire::put_u16(out, self.character_oid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRChangeSkillCardPresetID {
    pub set_id: u8,
    pub game_mode: GameMode,
}

impl ClientCommand for AcCmdCRChangeSkillCardPresetID {
    const ID: u16 = id::CR_CHANGE_SKILL_CARD_PRESET_ID;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            set_id: wire::get_u8(buf)?,
            game_mode: GameMode::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_room_decodes() {
        let mut out = BytesMut::new();
        wire::put_u32(&mut out, 42);
        wire::put_u32(&mut out, 0xDEAD_BEEF);
        wire::put_u32(&mut out, 1);

        let mut buf = out.freeze();
        let cmd = AcCmdCREnterRoom::decode(&mut buf).unwrap();
        assert_eq!(cmd.character_uid, 42);
        assert_eq!(cmd.one_time_password, 0xDEAD_BEEF);
        assert_eq!(cmd.room_uid, 1);
    }

    #[test]
    fn magic_use_round_trip() {
        let notify = AcCmdCRUseMagicItemNotify {
            character_oid: 3,
            magic_item_id: 2,
            target_oids: vec![5],
            cast_time: Some(1.0),
            effect_duration: Some(3.0),
        };
        let mut buf = notify.to_payload();

        // The serverbound twin reads the same layout.
        let cmd = AcCmdCRUseMagicItem::decode(&mut buf).unwrap();
        assert_eq!(cmd.character_oid, 3);
        assert_eq!(cmd.magic_item_id, 2);
        assert_eq!(cmd.target_oids, vec![5]);
        assert_eq!(cmd.cast_time, Some(1.0));
        assert_eq!(cmd.effect_duration, Some(3.0));
    }

    #[test]
    fn relay_keeps_trailing_data() {
        let mut out = BytesMut::new();
        wire::put_u16(&mut out, 9);
        wire::put_u32(&mut out, 1);
        wire::put_u32(&mut out, 2);
        out.extend_from_slice(b"opaque");

        let mut buf = out.freeze();
        let cmd = AcCmdCRRelay::decode(&mut buf).unwrap();
        assert_eq!(cmd.oid, 9);
        assert_eq!(&cmd.data[..], b"opaque");
    }

    #[test]
    fn update_pos_layout() {
        let mut out = BytesMut::new();
        wire::put_u16(&mut out, 1);
        wire::put_vec3(&mut out, [1.0, 2.0, 3.0]);
        wire::put_f32(&mut out, 0.5);

        let mut buf = out.freeze();
        let cmd = AcCmdUserRaceUpdatePos::decode(&mut buf).unwrap();
        assert_eq!(cmd.oid, 1);
        assert_eq!(cmd.position, [1.0, 2.0, 3.0]);
        assert_eq!(cmd.heading, 0.5);
    }

    #[test]
    fn options_bitfield_constants_are_distinct() {
        let all = room_option::NAME
            | room_option::PLAYER_COUNT
            | room_option::PASSWORD
            | room_option::GAME_MODE
            | room_option::MAP_BLOCK_ID
            | room_option::NPC_RACE;
        assert_eq!(all, 0b11_1111);
    }
}
