//! Shared protocol enums and composite structures.

use bytes::Bytes;
use bytes::BytesMut;

use crate::wire;
use crate::ProtoError;

/// A persistent entity uid. Zero is "no entity".
pub type Uid = u32;
pub const INVALID_UID: Uid = 0;

/// An in-race entity oid, unique per race instance, assigned from 1.
pub type Oid = u16;
pub const INVALID_OID: Oid = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameMode {
    Speed = 1,
    Magic = 2,
    Guild = 3,
    Tutorial = 6,
}

impl GameMode {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            1 => Ok(GameMode::Speed),
            2 => Ok(GameMode::Magic),
            3 => Ok(GameMode::Guild),
            6 => Ok(GameMode::Tutorial),
            _ => Err(ProtoError::Malformed("unknown game mode")),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Self::from_u8(wire::get_u8(buf)?)
    }

    pub fn encode(self, out: &mut BytesMut) {
        wire::put_u8(out, self as u8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TeamMode {
    Ffa = 1,
    Team = 2,
    Single = 3,
}

impl TeamMode {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            1 => Ok(TeamMode::Ffa),
            2 => Ok(TeamMode::Team),
            3 => Ok(TeamMode::Single),
            _ => Err(ProtoError::Malformed("unknown team mode")),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Self::from_u8(wire::get_u8(buf)?)
    }

    pub fn encode(self, out: &mut BytesMut) {
        wire::put_u8(out, self as u8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TeamColor {
    #[default]
    None = 0,
    Red = 1,
    Blue = 2,
}

impl TeamColor {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(TeamColor::None),
            1 => Ok(TeamColor::Red),
            2 => Ok(TeamColor::Blue),
            _ => Err(ProtoError::Malformed("unknown team color")),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Self::from_u8(wire::get_u8(buf)?)
    }

    pub fn encode(self, out: &mut BytesMut) {
        wire::put_u8(out, self as u8);
    }
}

/// Jump grading reported by the client on hurdle clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HurdleClearType {
    Collision = 0,
    Good = 1,
    Perfect = 2,
    DoubleJumpOrGlide = 3,
}

impl HurdleClearType {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(HurdleClearType::Collision),
            1 => Ok(HurdleClearType::Good),
            2 => Ok(HurdleClearType::Perfect),
            3 => Ok(HurdleClearType::DoubleJumpOrGlide),
            _ => Err(ProtoError::Malformed("unknown hurdle clear type")),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Self::from_u8(wire::get_u8(buf)?)
    }

    pub fn encode(self, out: &mut BytesMut) {
        wire::put_u8(out, self as u8);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacterParts {
    pub model_id: u8,
    pub mouth_id: u8,
    pub face_id: u8,
}

impl CharacterParts {
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            model_id: wire::get_u8(buf)?,
            mouth_id: wire::get_u8(buf)?,
            face_id: wire::get_u8(buf)?,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.model_id);
        wire::put_u8(out, self.mouth_id);
        wire::put_u8(out, self.face_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacterAppearance {
    pub voice_id: u8,
    pub head_size: u8,
    pub height: u8,
    pub thigh_volume: u8,
    pub leg_volume: u8,
    pub emblem_id: u8,
}

impl CharacterAppearance {
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        Ok(Self {
            voice_id: wire::get_u8(buf)?,
            head_size: wire::get_u8(buf)?,
            height: wire::get_u8(buf)?,
            thigh_volume: wire::get_u8(buf)?,
            leg_volume: wire::get_u8(buf)?,
            emblem_id: wire::get_u8(buf)?,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.voice_id);
        wire::put_u8(out, self.head_size);
        wire::put_u8(out, self.height);
        wire::put_u8(out, self.thigh_volume);
        wire::put_u8(out, self.leg_volume);
        wire::put_u8(out, self.emblem_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HorseParts {
    pub skin_id: u8,
    pub mane_id: u8,
    pub tail_id: u8,
    pub face_id: u8,
}

impl HorseParts {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.skin_id);
        wire::put_u8(out, self.mane_id);
        wire::put_u8(out, self.tail_id);
        wire::put_u8(out, self.face_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HorseAppearance {
    pub scale: u8,
    pub leg_length: u8,
    pub leg_volume: u8,
    pub body_length: u8,
    pub body_volume: u8,
}

impl HorseAppearance {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u8(out, self.scale);
        wire::put_u8(out, self.leg_length);
        wire::put_u8(out, self.leg_volume);
        wire::put_u8(out, self.body_length);
        wire::put_u8(out, self.body_volume);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtoHorse {
    pub uid: Uid,
    pub tid: u32,
    pub name: String,
    pub parts: HorseParts,
    pub appearance: HorseAppearance,
}

impl ProtoHorse {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_u32(out, self.tid);
        wire::put_string(out, &self.name);
        self.parts.encode(out);
        self.appearance.encode(out);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtoCharacter {
    pub uid: Uid,
    pub name: String,
    pub gender: u8,
    pub level: u16,
    pub parts: CharacterParts,
    pub appearance: CharacterAppearance,
}

impl ProtoCharacter {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u8(out, self.gender);
        wire::put_u16(out, self.level);
        self.parts.encode(out);
        self.appearance.encode(out);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoItem {
    pub uid: Uid,
    pub tid: u32,
    pub count: u32,
}

impl ProtoItem {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_u32(out, self.tid);
        wire::put_u32(out, self.count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GuildRole {
    #[default]
    Member = 0,
    Officer = 1,
    Owner = 2,
}

#[derive(Debug, Clone, Default)]
pub struct ProtoGuild {
    pub uid: Uid,
    pub name: String,
    pub role: GuildRole,
}

impl ProtoGuild {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u8(out, self.role as u8);
    }
}

/// A full visual: character, worn equipment, mount.
#[derive(Debug, Clone, Default)]
pub struct Avatar {
    pub character: ProtoCharacter,
    pub equipment: Vec<ProtoItem>,
    pub mount: ProtoHorse,
}

impl Avatar {
    pub fn encode(&self, out: &mut BytesMut) {
        self.character.encode(out);
        wire::put_list(out, &self.equipment, |o, i| i.encode(o));
        self.mount.encode(out);
    }
}

/// A room roster entry as seen by race clients.
#[derive(Debug, Clone, Default)]
pub struct Racer {
    pub uid: Uid,
    pub name: String,
    pub level: u16,
    pub is_master: bool,
    pub is_hidden: bool,
    pub is_npc: bool,
    pub is_ready: bool,
    pub team_color: TeamColor,
    pub avatar: Option<Avatar>,
    pub guild: Option<ProtoGuild>,
}

impl Racer {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u32(out, self.uid);
        wire::put_string(out, &self.name);
        wire::put_u16(out, self.level);
        wire::put_bool(out, self.is_master);
        wire::put_bool(out, self.is_hidden);
        wire::put_bool(out, self.is_npc);
        wire::put_bool(out, self.is_ready);
        self.team_color.encode(out);
        match &self.avatar {
            Some(avatar) => {
                wire::put_bool(out, true);
                avatar.encode(out);
            }
            None => wire::put_bool(out, false),
        }
        match &self.guild {
            Some(guild) => {
                wire::put_bool(out, true);
                guild.encode(out);
            }
            None => wire::put_bool(out, false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Quest {
    pub id: u16,
    pub progress: u32,
    pub state: u8,
}

impl Quest {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_u16(out, self.id);
        wire::put_u32(out, self.progress);
        wire::put_u8(out, self.state);
    }
}

/// Operator-togglable feature flags pushed to every lobby client.
#[derive(Debug, Clone, Default)]
pub struct SystemContent {
    pub values: Vec<(u8, u32)>,
}

impl SystemContent {
    pub fn encode(&self, out: &mut BytesMut) {
        wire::put_list(out, &self.values, |o, (key, value)| {
            wire::put_u8(o, *key);
            wire::put_u32(o, *value);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_mode_codes() {
        assert!(matches!(GameMode::from_u8(1), Ok(GameMode::Speed)));
        assert!(matches!(GameMode::from_u8(2), Ok(GameMode::Magic)));
        assert!(matches!(GameMode::from_u8(6), Ok(GameMode::Tutorial)));
        assert!(GameMode::from_u8(0).is_err());
        assert!(GameMode::from_u8(7).is_err());
    }

    #[test]
    fn racer_optional_sections() {
        let mut out = BytesMut::new();
        Racer {
            uid: 42,
            name: "alice".into(),
            level: 60,
            is_master: true,
            team_color: TeamColor::Red,
            ..Default::default()
        }
        .encode(&mut out);

        let mut buf = out.freeze();
        assert_eq!(wire::get_u32(&mut buf).unwrap(), 42);
        assert_eq!(wire::get_string(&mut buf).unwrap(), "alice");
        assert_eq!(wire::get_u16(&mut buf).unwrap(), 60);
        assert!(wire::get_bool(&mut buf).unwrap());
        // hidden, npc, ready
        assert!(!wire::get_bool(&mut buf).unwrap());
        assert!(!wire::get_bool(&mut buf).unwrap());
        assert!(!wire::get_bool(&mut buf).unwrap());
        assert_eq!(wire::get_u8(&mut buf).unwrap(), TeamColor::Red as u8);
        // no avatar, no guild
        assert!(!wire::get_bool(&mut buf).unwrap());
        assert!(!wire::get_bool(&mut buf).unwrap());
        assert!(buf.is_empty());
    }
}
