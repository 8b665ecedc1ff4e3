//! Builders from persistent records to their wire shapes.

use canterproto::common::{
    Avatar, CharacterAppearance, CharacterParts, GuildRole, HorseAppearance, HorseParts,
    ProtoCharacter, ProtoGuild, ProtoHorse, ProtoItem,
};
use canterproto::common::{Uid, INVALID_UID};

use crate::records::{self, Character, DataDirector, Guild, Horse, ItemRecord};

pub fn build_character(character: &Character) -> ProtoCharacter {
    ProtoCharacter {
        uid: character.uid,
        name: character.name.clone(),
        gender: character.gender,
        level: character.level,
        parts: build_character_parts(&character.parts),
        appearance: build_character_appearance(&character.appearance),
    }
}

pub fn build_character_parts(parts: &records::CharacterParts) -> CharacterParts {
    CharacterParts {
        model_id: parts.model_id,
        mouth_id: parts.mouth_id,
        face_id: parts.face_id,
    }
}

pub fn build_character_appearance(
    appearance: &records::CharacterAppearance,
) -> CharacterAppearance {
    CharacterAppearance {
        voice_id: appearance.voice_id,
        head_size: appearance.head_size,
        height: appearance.height,
        thigh_volume: appearance.thigh_volume,
        leg_volume: appearance.leg_volume,
        emblem_id: appearance.emblem_id,
    }
}

pub fn build_horse(horse: &Horse) -> ProtoHorse {
    ProtoHorse {
        uid: horse.uid,
        tid: horse.tid,
        name: horse.name.clone(),
        parts: HorseParts {
            skin_id: horse.parts.skin_id,
            mane_id: horse.parts.mane_id,
            tail_id: horse.parts.tail_id,
            face_id: horse.parts.face_id,
        },
        appearance: HorseAppearance {
            scale: horse.appearance.scale,
            leg_length: horse.appearance.leg_length,
            leg_volume: horse.appearance.leg_volume,
            body_length: horse.appearance.body_length,
            body_volume: horse.appearance.body_volume,
        },
    }
}

pub fn build_item(item: &ItemRecord) -> ProtoItem {
    ProtoItem {
        uid: item.uid,
        tid: item.tid,
        count: item.count,
    }
}

pub fn build_items(data: &DataDirector, uids: &[Uid]) -> Vec<ProtoItem> {
    data.items
        .get_many(uids)
        .iter()
        .map(|record| record.immutable(build_item))
        .collect()
}

pub fn build_guild(guild: &Guild, member_uid: Uid) -> ProtoGuild {
    let role = if guild.owner_uid == member_uid {
        GuildRole::Owner
    } else if guild.officers.contains(&member_uid) {
        GuildRole::Officer
    } else {
        GuildRole::Member
    };

    ProtoGuild {
        uid: guild.uid,
        name: guild.name.clone(),
        role,
    }
}

/// Builds the full avatar of a character: visuals, worn equipment, mount.
/// Records that are not loaded degrade to their defaults rather than fail.
pub fn build_avatar(data: &DataDirector, character: &Character) -> Avatar {
    let mut equipment = build_items(data, &character.character_equipment);
    equipment.extend(build_items(data, &character.mount_equipment));

    let mount = if character.mount_uid != INVALID_UID {
        data.horse(character.mount_uid)
            .map(|record| record.immutable(build_horse))
            .unwrap_or_default()
    } else {
        ProtoHorse::default()
    };

    Avatar {
        character: build_character(character),
        equipment,
        mount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guild_roles_follow_membership() {
        let guild = Guild {
            uid: 9,
            name: "wind riders".to_string(),
            description: String::new(),
            owner_uid: 1,
            officers: vec![2],
            members: vec![1, 2, 3],
        };

        assert_eq!(build_guild(&guild, 1).role, GuildRole::Owner);
        assert_eq!(build_guild(&guild, 2).role, GuildRole::Officer);
        assert_eq!(build_guild(&guild, 3).role, GuildRole::Member);
    }
}
