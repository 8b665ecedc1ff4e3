//! Lobby commands.
//!
//! Serverbound commands carry the `AcCmdCL` prefix, clientbound replies the
//! `AcCmdLC` prefix (the OK/Cancel twins of a serverbound command keep the
//! `CL` prefix the client expects).

use bytes::Bytes;
use bytes::BytesMut;

use crate::common::{
    CharacterAppearance, CharacterParts, GameMode, ProtoGuild, ProtoHorse, ProtoItem, Quest,
    SystemContent, TeamMode, Uid,
};
use crate::id;
use crate::wire;
use crate::ClientCommand;
use crate::ProtoError;
use crate::ServerCommand;

/// Game client versions this server speaks.
pub const PROTOCOL_CONSTANT0: u16 = 50;
pub const PROTOCOL_CONSTANT1: u16 = 281;

#[derive(Debug, Clone)]
pub struct AcCmdCLLogin {
    pub constant0: u16,
    pub constant1: u16,
    pub login_id: String,
    pub member_no: u32,
    pub auth_key: String,
}

impl ClientCommand for AcCmdCLLogin {
    const ID: u16 = id::CL_LOGIN;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            constant0: wire::get_u16(buf)?,
            constant1: wire::get_u16(buf)?,
            login_id: wire::get_string(buf)?,
            member_no: wire::get_u32(buf)?,
            auth_key: wire::get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLLoginOK {
    pub lobby_time: u64,
    pub uid: Uid,
    pub name: String,
    pub motd: String,
    pub gender: u8,
    pub introduction: String,
    pub level: u16,
    pub carrots: u32,
    pub cash: u32,
    pub role: u8,
    pub character_parts: CharacterParts,
    pub character_appearance: CharacterAppearance,
    pub character_equipment: Vec<ProtoItem>,
    pub mount_equipment: Vec<ProtoItem>,
    pub mount: ProtoHorse,
    pub guild: Option<ProtoGuild>,
    pub ranch_address: u32,
    pub ranch_port: u16,
    pub scrambling_constant: u32,
    pub system_content: SystemContent,
}

impl ServerCommand for AcCmdCLLoginOK {
    const ID: u16 = id::LC_LOGIN_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u64(out, self.lobby_time);
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_string(out, &self.motd);
        wire::put_u8(out, self.gender);
        wire::put_string(out, &self.introduction);
        wire::put_u16(out, self.level);
        wire::put_u32(out, self.carrots);
        wire::put_u32(out, self.cash);
        wire::put_u8(out, self.role);
        self.character_parts.encode(out);
        self.character_appearance.encode(out);
        wire::put_list(out, &self.character_equipment, |o, i| i.encode(o));
        wire::put_list(out, &self.mount_equipment, |o, i| i.encode(o));
        self.mount.encode(out);
        match &self.guild {
            Some(guild) => {
                wire::put_bool(out, true);
                guild.encode(out);
            }
            None => wire::put_bool(out, false),
        }
        wire::put_u32(out, self.ranch_address);
        wire::put_u16(out, self.ranch_port);
        wire::put_u32(out, self.scrambling_constant);
        self.system_content.encode(out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginCancelReason {
    Generic = 1,
    InvalidUser = 2,
    Duplicated = 3,
    InvalidVersion = 4,
    DisconnectYourself = 5,
    InvalidLoginId = 6,
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLLoginCancel {
    pub reason: LoginCancelReason,
}

impl ServerCommand for AcCmdCLLoginCancel {
    const ID: u16 = id::LC_LOGIN_CANCEL;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.reason as u8);
    }
}

/// Prompts the client to open the character creator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdLCCreateNicknameNotify;

impl ServerCommand for AcCmdLCCreateNicknameNotify {
    const ID: u16 = id::LC_CREATE_NICKNAME_NOTIFY;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone)]
pub struct AcCmdCLCreateNickname {
    pub nickname: String,
    pub parts: CharacterParts,
    pub appearance: CharacterAppearance,
}

impl ClientCommand for AcCmdCLCreateNickname {
    const ID: u16 = id::CL_CREATE_NICKNAME;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            nickname: wire::get_string(buf)?,
            parts: CharacterParts::decode(buf)?,
            appearance: CharacterAppearance::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLShowInventory;

impl ClientCommand for AcCmdCLShowInventory {
    const ID: u16 = id::CL_SHOW_INVENTORY;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLShowInventoryOK {
    pub items: Vec<ProtoItem>,
    pub horses: Vec<ProtoHorse>,
}

impl ServerCommand for AcCmdCLShowInventoryOK {
    const ID: u16 = id::LC_SHOW_INVENTORY_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_list(out, &self.items, |o, i| i.encode(o));
        wire::put_list(out, &self.horses, |o, h| h.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRoomList {
    pub page: u8,
    pub game_mode: GameMode,
    pub team_mode: TeamMode,
}

impl ClientCommand for AcCmdCLRoomList {
    const ID: u16 = id::CL_ROOM_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            page: wire::get_u8(buf)?,
            game_mode: GameMode::decode(buf)?,
            team_mode: TeamMode::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoomListState {
    Waiting = 0,
    Playing = 1,
}

#[derive(Debug, Clone)]
pub struct RoomListEntry {
    pub uid: Uid,
    pub name: String,
    pub state: RoomListState,
    pub is_locked: bool,
    pub player_count: u8,
    pub max_player_count: u8,
    pub skill_bracket: u8,
    pub map: u16,
}

impl RoomListEntry {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u8(out, self.state as u8);
        wire::put_bool(out, self.is_locked);
        wire::put_u8(out, self.player_count);
        wire::put_u8(out, self.max_player_count);
        wire::put_u8(out, self.skill_bracket);
        wire::put_u16(out, self.map);
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCLRoomListOK {
    pub page: u8,
    pub game_mode: GameMode,
    pub team_mode: TeamMode,
    pub rooms: Vec<RoomListEntry>,
}

impl ServerCommand for AcCmdCLRoomListOK {
    const ID: u16 = id::LC_ROOM_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.page);
        self.game_mode.encode(out);
        self.team_mode.encode(out);
        wire::put_list(out, &self.rooms, |o, r| r.encode(o));
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCLMakeRoom {
    pub name: String,
    pub password: String,
    pub player_count: u8,
    pub game_mode: GameMode,
    pub team_mode: TeamMode,
    pub mission_id: u16,
    pub npc_race: bool,
    pub skill_bracket: u8,
}

impl ClientCommand for AcCmdCLMakeRoom {
    const ID: u16 = id::CL_MAKE_ROOM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            name: wire::get_string(buf)?,
            password: wire::get_string(buf)?,
            player_count: wire::get_u8(buf)?,
            game_mode: GameMode::decode(buf)?,
            team_mode: TeamMode::decode(buf)?,
            mission_id: wire::get_u16(buf)?,
            npc_race: wire::get_bool(buf)?,
            skill_bracket: wire::get_u8(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLMakeRoomOK {
    pub room_uid: Uid,
    pub one_time_password: u32,
    pub race_address: u32,
    pub race_port: u16,
}

impl ServerCommand for AcCmdCLMakeRoomOK {
    const ID: u16 = id::LC_MAKE_ROOM_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.room_uid);
        wire::put_u32(out, self.one_time_password);
        wire::put_u32(out, self.race_address);
        wire::put_u16(out, self.race_port);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCLMakeRoomCancel;

impl ServerCommand for AcCmdCLMakeRoomCancel {
    const ID: u16 = id::LC_MAKE_ROOM_CANCEL;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone)]
pub struct AcCmdCLEnterRoom {
    pub room_uid: Uid,
    pub password: String,
}

impl ClientCommand for AcCmdCLEnterRoom {
    const ID: u16 = id::CL_ENTER_ROOM;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            room_uid: wire::get_u32(buf)?,
            password: wire::get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterRoomOK {
    pub room_uid: Uid,
    pub one_time_password: u32,
    pub race_address: u32,
    pub race_port: u16,
}

impl ServerCommand for AcCmdCLEnterRoomOK {
    const ID: u16 = id::LC_ENTER_ROOM_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.room_uid);
        wire::put_u32(out, self.one_time_password);
        wire::put_u32(out, self.race_address);
        wire::put_u16(out, self.race_port);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnterRoomCancelStatus {
    InvalidRoom = 1,
    BadPassword = 2,
    CrowdedRoom = 3,
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterRoomCancel {
    pub status: EnterRoomCancelStatus,
}

impl ServerCommand for AcCmdCLEnterRoomCancel {
    const ID: u16 = id::LC_ENTER_ROOM_CANCEL;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.status as u8);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLLeaveRoom;

impl ClientCommand for AcCmdCLLeaveRoom {
    const ID: u16 = id::CL_LEAVE_ROOM;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterRanch {
    pub rancher_uid: Uid,
}

impl ClientCommand for AcCmdCLEnterRanch {
    const ID: u16 = id::CL_ENTER_RANCH;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            rancher_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterRanchOK {
    pub rancher_uid: Uid,
    pub one_time_password: u32,
    pub ranch_address: u32,
    pub ranch_port: u16,
}

impl ServerCommand for AcCmdCLEnterRanchOK {
    const ID: u16 = id::LC_ENTER_RANCH_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.rancher_uid);
        wire::put_u32(out, self.one_time_password);
        wire::put_u32(out, self.ranch_address);
        wire::put_u16(out, self.ranch_port);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCLEnterRanchCancel;

impl ServerCommand for AcCmdCLEnterRanchCancel {
    const ID: u16 = id::LC_ENTER_RANCH_CANCEL;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterRanchRandomly;

impl ClientCommand for AcCmdCLEnterRanchRandomly {
    const ID: u16 = id::CL_ENTER_RANCH_RANDOMLY;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterChannel {
    pub channel: u8,
}

impl ClientCommand for AcCmdCLEnterChannel {
    const ID: u16 = id::CL_ENTER_CHANNEL;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            channel: wire::get_u8(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLEnterChannelOK {
    pub channel: u8,
    pub population: u16,
}

impl ServerCommand for AcCmdCLEnterChannelOK {
    const ID: u16 = id::LC_ENTER_CHANNEL_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.channel);
        wire::put_u16(out, self.population);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLLeaveChannel;

impl ClientCommand for AcCmdCLLeaveChannel {
    const ID: u16 = id::CL_LEAVE_CHANNEL;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCLLeaveChannelOK;

impl ServerCommand for AcCmdCLLeaveChannelOK {
    const ID: u16 = id::LC_LEAVE_CHANNEL_OK;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLHeartbeat;

impl ClientCommand for AcCmdCLHeartbeat {
    const ID: u16 = id::CL_HEARTBEAT;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLQueryServerTime;

impl ClientCommand for AcCmdCLQueryServerTime {
    const ID: u16 = id::CL_QUERY_SERVER_TIME;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLQueryServerTimeOK {
    pub lobby_time: u64,
}

impl ServerCommand for AcCmdCLQueryServerTimeOK {
    const ID: u16 = id::LC_QUERY_SERVER_TIME_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u64(out, self.lobby_time);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLGetMessengerInfo;

impl ClientCommand for AcCmdCLGetMessengerInfo {
    const ID: u16 = id::CL_GET_MESSENGER_INFO;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLGetMessengerInfoOK {
    pub code: u32,
    pub address: u32,
    pub port: u16,
}

impl ServerCommand for AcCmdCLGetMessengerInfoOK {
    const ID: u16 = id::LC_GET_MESSENGER_INFO_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.code);
        wire::put_u32(out, self.address);
        wire::put_u16(out, self.port);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLCheckWaitingSeqno;

impl ClientCommand for AcCmdCLCheckWaitingSeqno {
    const ID: u16 = id::CL_CHECK_WAITING_SEQNO;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLCheckWaitingSeqnoOK {
    pub position: u32,
}

impl ServerCommand for AcCmdCLCheckWaitingSeqnoOK {
    const ID: u16 = id::LC_CHECK_WAITING_SEQNO_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.position);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLAchievementCompleteList {
    pub character_uid: Uid,
}

impl ClientCommand for AcCmdCLAchievementCompleteList {
    const ID: u16 = id::CL_ACHIEVEMENT_COMPLETE_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLAchievementCompleteListOK {
    pub character_uid: Uid,
    pub achievements: Vec<Quest>,
}

impl ServerCommand for AcCmdCLAchievementCompleteListOK {
    const ID: u16 = id::LC_ACHIEVEMENT_COMPLETE_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_list(out, &self.achievements, |o, q| q.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestQuestList {
    pub character_uid: Uid,
}

impl ClientCommand for AcCmdCLRequestQuestList {
    const ID: u16 = id::CL_REQUEST_QUEST_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLRequestQuestListOK {
    pub character_uid: Uid,
    pub quests: Vec<Quest>,
}

impl ServerCommand for AcCmdCLRequestQuestListOK {
    const ID: u16 = id::LC_REQUEST_QUEST_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_list(out, &self.quests, |o, q| q.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestDailyQuestList {
    pub character_uid: Uid,
}

impl ClientCommand for AcCmdCLRequestDailyQuestList {
    const ID: u16 = id::CL_REQUEST_DAILY_QUEST_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLRequestDailyQuestListOK {
    pub character_uid: Uid,
    pub quests: Vec<Quest>,
}

impl ServerCommand for AcCmdCLRequestDailyQuestListOK {
    const ID: u16 = id::LC_REQUEST_DAILY_QUEST_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_list(out, &self.quests, |o, q| q.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestSpecialEventList {
    pub character_uid: Uid,
}

impl ClientCommand for AcCmdCLRequestSpecialEventList {
    const ID: u16 = id::CL_REQUEST_SPECIAL_EVENT_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLRequestSpecialEventListOK {
    pub character_uid: Uid,
    pub events: Vec<Quest>,
}

impl ServerCommand for AcCmdCLRequestSpecialEventListOK {
    const ID: u16 = id::LC_REQUEST_SPECIAL_EVENT_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_list(out, &self.events, |o, q| q.encode(o));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestLeagueInfo;

impl ClientCommand for AcCmdCLRequestLeagueInfo {
    const ID: u16 = id::CL_REQUEST_LEAGUE_INFO;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCLRequestLeagueInfoOK {
    pub season: u8,
    pub league: u8,
    pub rank: u32,
    pub points: u32,
}

impl ServerCommand for AcCmdCLRequestLeagueInfoOK {
    const ID: u16 = id::LC_REQUEST_LEAGUE_INFO_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.season);
        wire::put_u8(out, self.league);
        wire::put_u32(out, self.rank);
        wire::put_u32(out, self.points);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersonalInfoType {
    Basic = 1,
    Courses = 2,
    Eight = 8,
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestPersonalInfo {
    pub character_uid: Uid,
    pub kind: PersonalInfoType,
}

impl ClientCommand for AcCmdCLRequestPersonalInfo {
    const ID: u16 = id::CL_REQUEST_PERSONAL_INFO;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        let character_uid = wire::get_u32(buf)?;
        let kind = match wire::get_u8(buf)? {
            1 => PersonalInfoType::Basic,
            2 => PersonalInfoType::Courses,
            8 => PersonalInfoType::Eight,
            _ => return Err(ProtoError::Malformed("unknown personal info type")),
        };
        Ok(Self {
            character_uid,
            kind,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdLCPersonalInfo {
    pub character_uid: Uid,
    pub kind: u8,
    pub level: u16,
    pub introduction: String,
    pub guild_name: String,
}

impl ServerCommand for AcCmdLCPersonalInfo {
    const ID: u16 = id::LC_PERSONAL_INFO;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_u8(out, self.kind);
        wire::put_u16(out, self.level);
        wire::put_string(out, &self.introduction);
        wire::put_string(out, &self.guild_name);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLRequestMountInfo {
    pub character_uid: Uid,
}

impl ClientCommand for AcCmdCLRequestMountInfo {
    const ID: u16 = id::CL_REQUEST_MOUNT_INFO;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountInfoEntry {
    pub uid: Uid,
    pub name: String,
    pub total_distance: u32,
    pub top_speed: u32,
    pub speed_wins: u32,
    pub magic_wins: u32,
    pub best_boost_combo: u32,
}

impl MountInfoEntry {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u32(out, self.total_distance);
        wire::put_u32(out, self.top_speed);
        wire::put_u32(out, self.speed_wins);
        wire::put_u32(out, self.magic_wins);
        wire::put_u32(out, self.best_boost_combo);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLRequestMountInfoOK {
    pub character_uid: Uid,
    pub mounts: Vec<MountInfoEntry>,
}

impl ServerCommand for AcCmdCLRequestMountInfoOK {
    const ID: u16 = id::LC_REQUEST_MOUNT_INFO_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_list(out, &self.mounts, |o, m| m.encode(o));
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCLSetIntroduction {
    pub introduction: String,
}

impl ClientCommand for AcCmdCLSetIntroduction {
    const ID: u16 = id::CL_SET_INTRODUCTION;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            introduction: wire::get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLGoodsShopList {
    pub shop_id: u8,
}

impl ClientCommand for AcCmdCLGoodsShopList {
    const ID: u16 = id::CL_GOODS_SHOP_LIST;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            shop_id: wire::get_u8(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GoodsEntry {
    pub goods_id: u32,
    pub item_tid: u32,
    pub price_carrots: u32,
    pub price_cash: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLGoodsShopListOK {
    pub shop_id: u8,
    pub goods: Vec<GoodsEntry>,
}

impl ServerCommand for AcCmdCLGoodsShopListOK {
    const ID: u16 = id::LC_GOODS_SHOP_LIST_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.shop_id);
        wire::put_list(out, &self.goods, |o, g| {
            wire::put_u32(o, g.goods_id);
            wire::put_u32(o, g.item_tid);
            wire::put_u32(o, g.price_carrots);
            wire::put_u32(o, g.price_cash);
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLUpdateSystemContent {
    pub key: u8,
    pub value: u32,
}

impl ClientCommand for AcCmdCLUpdateSystemContent {
    const ID: u16 = id::CL_UPDATE_SYSTEM_CONTENT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            key: wire::get_u8(buf)?,
            value: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdLCUpdateSystemContent {
    pub system_content: SystemContent,
}

impl ServerCommand for AcCmdLCUpdateSystemContent {
    const ID: u16 = id::LC_UPDATE_SYSTEM_CONTENT;

    fn encode(&self, out: &mut BytesMut) {
        self.system_content.encode(out);
    }
}

/// An operator notice shown in the client's system chat.
#[derive(Debug, Clone, Default)]
pub struct AcCmdLCNotice {
    pub notice: String,
}

impl ServerCommand for AcCmdLCNotice {
    const ID: u16 = id::LC_NOTICE;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_string(out, &self.notice);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdLCOpMute {
    pub duration: u64,
}

impl ServerCommand for AcCmdLCOpMute {
    const ID: u16 = id::LC_OP_MUTE;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u64(out, self.duration);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdLCInviteGuildJoin {
    pub character_uid: Uid,
    pub inviter_uid: Uid,
    pub inviter_name: String,
    pub guild: ProtoGuild,
    pub guild_description: String,
}

impl ServerCommand for AcCmdLCInviteGuildJoin {
    const ID: u16 = id::LC_INVITE_GUILD_JOIN;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_u32(out, self.inviter_uid);
        wire::put_string(out, &self.inviter_name);
        self.guild.encode(out);
        wire::put_string(out, &self.guild_description);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLAcceptInviteToGuild {
    pub guild_uid: Uid,
}

impl ClientCommand for AcCmdCLAcceptInviteToGuild {
    const ID: u16 = id::CL_ACCEPT_INVITE_TO_GUILD;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            guild_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCLAcceptInviteToGuildOK {
    pub guild: ProtoGuild,
}

impl ServerCommand for AcCmdCLAcceptInviteToGuildOK {
    const ID: u16 = id::LC_ACCEPT_INVITE_TO_GUILD_OK;

    fn encode(&self, out: &mut BytesMut) {
        self.guild.encode(out);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCLDeclineInviteToGuild {
    pub guild_uid: Uid,
}

impl ClientCommand for AcCmdCLDeclineInviteToGuild {
    const ID: u16 = id::CL_DECLINE_INVITE_TO_GUILD;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            guild_uid: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCLUpdateUserSettings {
    pub hide_avatars: bool,
    pub decline_whispers: bool,
    pub key_bindings: String,
}

impl ClientCommand for AcCmdCLUpdateUserSettings {
    const ID: u16 = id::CL_UPDATE_USER_SETTINGS;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            hide_avatars: wire::get_bool(buf)?,
            decline_whispers: wire::get_bool(buf)?,
            key_bindings: wire::get_string(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_login() -> Bytes {
        let mut out = BytesMut::new();
        wire::put_u16(&mut out, PROTOCOL_CONSTANT0);
        wire::put_u16(&mut out, PROTOCOL_CONSTANT1);
        wire::put_string(&mut out, "alice");
        wire::put_u32(&mut out, 1234);
        wire::put_string(&mut out, "token");
        out.freeze()
    }

    #[test]
    fn decodes_login() {
        let mut buf = encode_login();
        let cmd = AcCmdCLLogin::decode(&mut buf).unwrap();
        assert_eq!(cmd.constant0, 50);
        assert_eq!(cmd.constant1, 281);
        assert_eq!(cmd.login_id, "alice");
        assert_eq!(cmd.member_no, 1234);
        assert_eq!(cmd.auth_key, "token");
    }

    #[test]
    fn truncated_login_is_too_short() {
        let full = encode_login();
        let mut buf = full.slice(0..3);
        assert!(AcCmdCLLogin::decode(&mut buf).is_err());
    }

    #[test]
    fn make_room_round_trip() {
        let mut out = BytesMut::new();
        wire::put_string(&mut out, "race me");
        wire::put_string(&mut out, "");
        wire::put_u8(&mut out, 4);
        wire::put_u8(&mut out, GameMode::Speed as u8);
        wire::put_u8(&mut out, TeamMode::Ffa as u8);
        wire::put_u16(&mut out, 0);
        wire::put_u8(&mut out, 0);
        wire::put_u8(&mut out, 2);

        let mut buf = out.freeze();
        let cmd = AcCmdCLMakeRoom::decode(&mut buf).unwrap();
        assert_eq!(cmd.name, "race me");
        assert_eq!(cmd.player_count, 4);
        assert_eq!(cmd.game_mode, GameMode::Speed);
        assert_eq!(cmd.team_mode, TeamMode::Ffa);
        assert!(!cmd.npc_race);
        assert_eq!(cmd.skill_bracket, 2);
    }

    #[test]
    fn login_cancel_payload_is_reason_byte() {
        let payload = AcCmdCLLoginCancel {
            reason: LoginCancelReason::Duplicated,
        }
        .to_payload();
        assert_eq!(&payload[..], &[LoginCancelReason::Duplicated as u8]);
    }

    #[test]
    fn empty_commands_have_empty_payloads() {
        assert!(AcCmdLCCreateNicknameNotify.to_payload().is_empty());
        assert!(AcCmdCLMakeRoomCancel.to_payload().is_empty());
    }
}
