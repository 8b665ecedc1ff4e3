//! Ranch commands.
//!
//! The ranch is a persistent social space. Traffic is a small subset of the
//! race surface: authorize, roster, join/leave notifies, chat, and slow
//! position updates.

use bytes::Bytes;
use bytes::BytesMut;

use crate::common::{Avatar, Uid};
use crate::id;
use crate::wire;
use crate::ClientCommand;
use crate::ProtoError;
use crate::ServerCommand;

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCREnterRanch {
    pub character_uid: Uid,
    pub one_time_password: u32,
    pub rancher_uid: Uid,
}

impl ClientCommand for AcCmdCREnterRanch {
    const ID: u16 = id::CR_ENTER_RANCH;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            character_uid: wire::get_u32(buf)?,
            one_time_password: wire::get_u32(buf)?,
            rancher_uid: wire::get_u32(buf)?,
        })
    }
}

/// A character present in a ranch.
#[derive(Debug, Clone, Default)]
pub struct RanchResident {
    pub uid: Uid,
    pub name: String,
    pub introduction: String,
    pub avatar: Avatar,
}

impl RanchResident {
    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_string(out, &self.introduction);
        self.avatar.encode(out);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCREnterRanchOK {
    pub rancher_uid: Uid,
    pub ranch_name: String,
    pub residents: Vec<RanchResident>,
}

impl ServerCommand for AcCmdCREnterRanchOK {
    const ID: u16 = id::RC_ENTER_RANCH_OK;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.rancher_uid);
        wire::put_string(out, &self.ranch_name);
        wire::put_list(out, &self.residents, |o, r| r.encode(o));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCREnterRanchCancel;

impl ServerCommand for AcCmdCREnterRanchCancel {
    const ID: u16 = id::RC_ENTER_RANCH_CANCEL;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCREnterRanchNotify {
    pub resident: RanchResident,
}

impl ServerCommand for AcCmdCREnterRanchNotify {
    const ID: u16 = id::RC_ENTER_RANCH_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        self.resident.encode(out);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLeaveRanch;

impl ClientCommand for AcCmdCRLeaveRanch {
    const ID: u16 = id::CR_LEAVE_RANCH;

    fn decode(_buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcCmdCRLeaveRanchOK;

impl ServerCommand for AcCmdCRLeaveRanchOK {
    const ID: u16 = id::RC_LEAVE_RANCH_OK;

    fn encode(&self, _out: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRLeaveRanchNotify {
    pub character_uid: Uid,
}

impl ServerCommand for AcCmdCRLeaveRanchNotify {
    const ID: u16 = id::RC_LEAVE_RANCH_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
    }
}

#[derive(Debug, Clone)]
pub struct AcCmdCRRanchChat {
    pub message: String,
}

impl ClientCommand for AcCmdCRRanchChat {
    const ID: u16 = id::CR_RANCH_CHAT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            message: wire::get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdCRRanchChatNotify {
    pub author: String,
    pub message: String,
    pub is_system: bool,
}

impl ServerCommand for AcCmdCRRanchChatNotify {
    const ID: u16 = id::RC_RANCH_CHAT_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_string(out, &self.author);
        wire::put_string(out, &self.message);
        wire::put_bool(out, self.is_system);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcCmdRCSetIntroductionNotify {
    pub character_uid: Uid,
    pub introduction: String,
}

impl ServerCommand for AcCmdRCSetIntroductionNotify {
    const ID: u16 = id::RC_SET_INTRODUCTION_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_string(out, &self.introduction);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdCRRanchSnapshot {
    pub position: [f32; 3],
    pub heading: f32,
}

impl ClientCommand for AcCmdCRRanchSnapshot {
    const ID: u16 = id::CR_RANCH_SNAPSHOT;

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            position: wire::get_vec3(buf)?,
            heading: wire::get_f32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcCmdRCRanchSnapshotNotify {
    pub character_uid: Uid,
    pub position: [f32; 3],
    pub heading: f32,
}

impl ServerCommand for AcCmdRCRanchSnapshotNotify {
    const ID: u16 = id::RC_RANCH_SNAPSHOT_NOTIFY;

    fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.character_uid);
        wire::put_vec3(out, self.position);
        wire::put_f32(out, self.heading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_ranch_decodes() {
        let mut out = BytesMut::new();
        wire::put_u32(&mut out, 42);
        wire::put_u32(&mut out, 777);
        wire::put_u32(&mut out, 43);

        let mut buf = out.freeze();
        let cmd = AcCmdCREnterRanch::decode(&mut buf).unwrap();
        assert_eq!(cmd.character_uid, 42);
        assert_eq!(cmd.one_time_password, 777);
        assert_eq!(cmd.rancher_uid, 43);
    }

    #[test]
    fn snapshot_notify_layout() {
        let payload = AcCmdRCRanchSnapshotNotify {
            character_uid: 7,
            position: [1.0, 2.0, 3.0],
            heading: 0.25,
        }
        .to_payload();
        assert_eq!(payload.len(), 4 + 12 + 4);
    }
}
