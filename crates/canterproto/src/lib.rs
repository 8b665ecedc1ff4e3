//! `canterproto`: typed command definitions for the game protocol.
//!
//! Commands travel inside a `canterio` frame; the frame header carries the
//! command id, the payload is the fields in little-endian with
//! null-terminated strings. Serverbound commands implement [`ClientCommand`]
//! (decode only), clientbound commands implement [`ServerCommand`]
//! (encode only); the handful that travel both ways implement both.
//!
//! Decoders return owned values; strings are validated UTF-8.

use bytes::Bytes;
use bytes::BytesMut;

pub mod common;
pub mod lobby;
pub mod race;
pub mod ranch;
pub mod wire;

#[derive(Debug, Clone)]
pub enum ProtoError {
    TooShort { need: usize, got: usize },
    UnknownCommand(u16),
    Malformed(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::TooShort { need, got } => {
                write!(f, "command too short: need {need}, got {got}")
            }
            ProtoError::UnknownCommand(id) => write!(f, "unknown command id: 0x{id:04x}"),
            ProtoError::Malformed(s) => write!(f, "malformed command: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}

/// A serverbound command. The id is carried by the frame header.
pub trait ClientCommand: Sized + Send + 'static {
    const ID: u16;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError>;
}

/// A clientbound command.
pub trait ServerCommand: Send + 'static {
    const ID: u16;

    fn encode(&self, out: &mut BytesMut);

    fn to_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

/// The command id table.
///
/// Ids are grouped by endpoint: lobby in 0x00xx, race in 0x01xx, ranch in
/// 0x02xx. The table is part of the client compatibility surface; extend it,
/// never renumber it.
pub mod id {
    // Lobby.
    pub const CL_LOGIN: u16 = 0x0007;
    pub const LC_LOGIN_OK: u16 = 0x0008;
    pub const LC_LOGIN_CANCEL: u16 = 0x0009;
    pub const LC_CREATE_NICKNAME_NOTIFY: u16 = 0x000A;
    pub const CL_CREATE_NICKNAME: u16 = 0x000B;
    pub const CL_SHOW_INVENTORY: u16 = 0x000C;
    pub const LC_SHOW_INVENTORY_OK: u16 = 0x000D;
    pub const CL_ROOM_LIST: u16 = 0x000E;
    pub const LC_ROOM_LIST_OK: u16 = 0x000F;
    pub const CL_MAKE_ROOM: u16 = 0x0010;
    pub const LC_MAKE_ROOM_OK: u16 = 0x0011;
    pub const LC_MAKE_ROOM_CANCEL: u16 = 0x0012;
    pub const CL_ENTER_ROOM: u16 = 0x0013;
    pub const LC_ENTER_ROOM_OK: u16 = 0x0014;
    pub const LC_ENTER_ROOM_CANCEL: u16 = 0x0015;
    pub const CL_LEAVE_ROOM: u16 = 0x0016;
    pub const CL_ENTER_RANCH: u16 = 0x0017;
    pub const LC_ENTER_RANCH_OK: u16 = 0x0018;
    pub const LC_ENTER_RANCH_CANCEL: u16 = 0x0019;
    pub const CL_ENTER_RANCH_RANDOMLY: u16 = 0x001A;
    pub const CL_ENTER_CHANNEL: u16 = 0x001B;
    pub const LC_ENTER_CHANNEL_OK: u16 = 0x001C;
    pub const CL_LEAVE_CHANNEL: u16 = 0x001D;
    pub const LC_LEAVE_CHANNEL_OK: u16 = 0x001E;
    pub const CL_HEARTBEAT: u16 = 0x001F;
    pub const CL_QUERY_SERVER_TIME: u16 = 0x0020;
    pub const LC_QUERY_SERVER_TIME_OK: u16 = 0x0021;
    pub const CL_GET_MESSENGER_INFO: u16 = 0x0022;
    pub const LC_GET_MESSENGER_INFO_OK: u16 = 0x0023;
    pub const CL_CHECK_WAITING_SEQNO: u16 = 0x0024;
    pub const LC_CHECK_WAITING_SEQNO_OK: u16 = 0x0025;
    pub const CL_ACHIEVEMENT_COMPLETE_LIST: u16 = 0x0026;
    pub const LC_ACHIEVEMENT_COMPLETE_LIST_OK: u16 = 0x0027;
    pub const CL_REQUEST_QUEST_LIST: u16 = 0x0028;
    pub const LC_REQUEST_QUEST_LIST_OK: u16 = 0x0029;
    pub const CL_REQUEST_DAILY_QUEST_LIST: u16 = 0x002A;
    pub const LC_REQUEST_DAILY_QUEST_LIST_OK: u16 = 0x002B;
    pub const CL_REQUEST_SPECIAL_EVENT_LIST: u16 = 0x002C;
    pub const LC_REQUEST_SPECIAL_EVENT_LIST_OK: u16 = 0x002D;
    pub const CL_REQUEST_LEAGUE_INFO: u16 = 0x002E;
    pub const LC_REQUEST_LEAGUE_INFO_OK: u16 = 0x002F;
    pub const CL_REQUEST_PERSONAL_INFO: u16 = 0x0030;
    pub const LC_PERSONAL_INFO: u16 = 0x0031;
    pub const CL_REQUEST_MOUNT_INFO: u16 = 0x0032;
    pub const LC_REQUEST_MOUNT_INFO_OK: u16 = 0x0033;
    pub const CL_SET_INTRODUCTION: u16 = 0x0034;
    pub const CL_GOODS_SHOP_LIST: u16 = 0x0035;
    pub const LC_GOODS_SHOP_LIST_OK: u16 = 0x0036;
    pub const CL_UPDATE_SYSTEM_CONTENT: u16 = 0x0037;
    pub const LC_UPDATE_SYSTEM_CONTENT: u16 = 0x0038;
    pub const LC_NOTICE: u16 = 0x0039;
    pub const LC_OP_MUTE: u16 = 0x003A;
    pub const LC_INVITE_GUILD_JOIN: u16 = 0x003B;
    pub const CL_ACCEPT_INVITE_TO_GUILD: u16 = 0x003C;
    pub const LC_ACCEPT_INVITE_TO_GUILD_OK: u16 = 0x003D;
    pub const CL_DECLINE_INVITE_TO_GUILD: u16 = 0x003E;
    pub const CL_UPDATE_USER_SETTINGS: u16 = 0x003F;

    // Race.
    pub const CR_ENTER_ROOM: u16 = 0x0101;
    pub const RC_ENTER_ROOM_OK: u16 = 0x0102;
    pub const RC_ENTER_ROOM_CANCEL: u16 = 0x0103;
    pub const RC_ENTER_ROOM_NOTIFY: u16 = 0x0104;
    pub const CR_CHANGE_ROOM_OPTIONS: u16 = 0x0105;
    pub const RC_CHANGE_ROOM_OPTIONS_NOTIFY: u16 = 0x0106;
    pub const CR_CHANGE_TEAM: u16 = 0x0107;
    pub const RC_CHANGE_TEAM_OK: u16 = 0x0108;
    pub const RC_CHANGE_TEAM_NOTIFY: u16 = 0x0109;
    pub const CR_LEAVE_ROOM: u16 = 0x010A;
    pub const RC_LEAVE_ROOM_OK: u16 = 0x010B;
    pub const RC_LEAVE_ROOM_NOTIFY: u16 = 0x010C;
    pub const RC_CHANGE_MASTER_NOTIFY: u16 = 0x010D;
    pub const CR_READY_RACE: u16 = 0x010E;
    pub const RC_READY_RACE_NOTIFY: u16 = 0x010F;
    pub const CR_START_RACE: u16 = 0x0110;
    pub const RC_START_RACE_NOTIFY: u16 = 0x0111;
    pub const RC_ROOM_COUNTDOWN: u16 = 0x0112;
    pub const CR_LOADING_COMPLETE: u16 = 0x0113;
    pub const RC_LOADING_COMPLETE_NOTIFY: u16 = 0x0114;
    pub const USER_RACE_TIMER: u16 = 0x0115;
    pub const USER_RACE_TIMER_OK: u16 = 0x0116;
    pub const USER_RACE_COUNTDOWN: u16 = 0x0117;
    pub const USER_RACE_UPDATE_POS: u16 = 0x0118;
    pub const USER_RACE_FINAL: u16 = 0x0119;
    pub const USER_RACE_FINAL_NOTIFY: u16 = 0x011A;
    pub const CR_RACE_RESULT: u16 = 0x011B;
    pub const RC_RACE_RESULT_OK: u16 = 0x011C;
    pub const RC_RACE_RESULT_NOTIFY: u16 = 0x011D;
    pub const CR_P2P_RESULT: u16 = 0x011E;
    pub const GAME_RACE_P2P_RESULT: u16 = 0x011F;
    pub const USER_RACE_P2P_RESULT: u16 = 0x0120;
    pub const CR_AWARD_START: u16 = 0x0121;
    pub const RC_AWARD_NOTIFY: u16 = 0x0122;
    pub const CR_AWARD_END: u16 = 0x0123;
    pub const CR_STAR_POINT_GET: u16 = 0x0124;
    pub const RC_STAR_POINT_GET_OK: u16 = 0x0125;
    pub const CR_REQUEST_SPUR: u16 = 0x0126;
    pub const RC_REQUEST_SPUR_OK: u16 = 0x0127;
    pub const CR_HURDLE_CLEAR_RESULT: u16 = 0x0128;
    pub const RC_HURDLE_CLEAR_RESULT_OK: u16 = 0x0129;
    pub const CR_STARTING_RATE: u16 = 0x012A;
    pub const GAME_RACE_ITEM_SPAWN: u16 = 0x012B;
    pub const USER_RACE_ITEM_GET: u16 = 0x012C;
    pub const GAME_RACE_ITEM_GET: u16 = 0x012D;
    pub const CR_REQUEST_MAGIC_ITEM: u16 = 0x012E;
    pub const RC_REQUEST_MAGIC_ITEM_OK: u16 = 0x012F;
    pub const RC_REQUEST_MAGIC_ITEM_NOTIFY: u16 = 0x0130;
    pub const CR_USE_MAGIC_ITEM: u16 = 0x0131;
    pub const RC_USE_MAGIC_ITEM_OK: u16 = 0x0132;
    pub const RC_USE_MAGIC_ITEM_NOTIFY: u16 = 0x0133;
    pub const CR_START_MAGIC_TARGET: u16 = 0x0134;
    pub const CR_CHANGE_MAGIC_TARGET_NOTIFY: u16 = 0x0135;
    pub const CR_CHANGE_MAGIC_TARGET_OK: u16 = 0x0136;
    pub const CR_CHANGE_MAGIC_TARGET_CANCEL: u16 = 0x0137;
    pub const RC_REMOVE_MAGIC_TARGET: u16 = 0x0138;
    pub const CR_CHAT: u16 = 0x0139;
    pub const RC_CHAT_NOTIFY: u16 = 0x013A;
    pub const CR_RELAY_COMMAND: u16 = 0x013B;
    pub const RC_RELAY_COMMAND_NOTIFY: u16 = 0x013C;
    pub const CR_RELAY: u16 = 0x013D;
    pub const RC_RELAY_NOTIFY: u16 = 0x013E;
    pub const USER_RACE_ACTIVATE_INTERACTIVE_EVENT: u16 = 0x013F;
    pub const USER_RACE_ACTIVATE_EVENT: u16 = 0x0140;
    pub const CR_CHANGE_SKILL_CARD_PRESET_ID: u16 = 0x0141;

    // Ranch.
    pub const CR_ENTER_RANCH: u16 = 0x0201;
    pub const RC_ENTER_RANCH_OK: u16 = 0x0202;
    pub const RC_ENTER_RANCH_CANCEL: u16 = 0x0203;
    pub const RC_ENTER_RANCH_NOTIFY: u16 = 0x0204;
    pub const CR_LEAVE_RANCH: u16 = 0x0205;
    pub const RC_LEAVE_RANCH_OK: u16 = 0x0206;
    pub const RC_LEAVE_RANCH_NOTIFY: u16 = 0x0207;
    pub const CR_RANCH_CHAT: u16 = 0x0208;
    pub const RC_RANCH_CHAT_NOTIFY: u16 = 0x0209;
    pub const RC_SET_INTRODUCTION_NOTIFY: u16 = 0x020A;
    pub const CR_RANCH_SNAPSHOT: u16 = 0x020B;
    pub const RC_RANCH_SNAPSHOT_NOTIFY: u16 = 0x020C;
}
