use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use rand::Rng;
use serde::Deserialize;

use crate::records::{HorseAppearance, HorseParts};

/// Course ids that mean "pick from the pool" rather than a concrete map.
pub const ALL_MAPS_COURSE_ID: u16 = 10000;
pub const NEW_MAPS_COURSE_ID: u16 = 10001;
pub const HOT_MAPS_COURSE_ID: u16 = 10002;

pub fn is_pseudo_course(course_id: u16) -> bool {
    matches!(
        course_id,
        ALL_MAPS_COURSE_ID | NEW_MAPS_COURSE_ID | HOT_MAPS_COURSE_ID
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameModeInfo {
    pub id: u8,
    pub star_points_max: u32,
    pub spur_consume_star_points: u32,
    pub starting_rate_max: u32,
    pub perfect_jump_star_points: u32,
    pub perfect_jump_unit_star_points: u32,
    pub perfect_jump_max_bonus_combo: u32,
    pub good_jump_star_points: u32,
    #[serde(default)]
    pub used_deck_item_ids: Vec<u32>,
    #[serde(default)]
    pub map_pool: Vec<u16>,
    #[serde(default)]
    pub bonus_skills: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeckItemSpawn {
    pub deck_id: u32,
    pub position: [f32; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapBlockInfo {
    pub id: u16,
    #[serde(default)]
    pub name: String,
    pub time_limit_s: u64,
    pub wait_time_s: u64,
    pub required_level: u16,
    pub offset: [f32; 3],
    #[serde(default)]
    pub deck_items: Vec<DeckItemSpawn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemDeckInfo {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub respawn_ms: u64,
}

#[derive(Debug, Deserialize)]
struct GameModesFile {
    game_modes: Vec<GameModeInfo>,
}

#[derive(Debug, Deserialize)]
struct MapBlocksFile {
    map_blocks: Vec<MapBlockInfo>,
}

#[derive(Debug, Deserialize)]
struct ItemDecksFile {
    item_decks: Vec<ItemDeckInfo>,
}

const GAME_MODES_YAML: &str = include_str!("../data/game_modes.yaml");
const MAP_BLOCKS_YAML: &str = include_str!("../data/map_blocks.yaml");
const ITEM_DECKS_YAML: &str = include_str!("../data/item_decks.yaml");

/// The content tables: game modes, map blocks, item decks.
///
/// Tables ship embedded; a deployment may override any of the three files
/// from a registry directory.
pub struct CourseRegistry {
    game_modes: HashMap<u8, GameModeInfo>,
    map_blocks: HashMap<u16, MapBlockInfo>,
    item_decks: HashMap<u32, ItemDeckInfo>,
}

impl CourseRegistry {
    pub fn load_embedded() -> anyhow::Result<Self> {
        Self::parse(GAME_MODES_YAML, MAP_BLOCKS_YAML, ITEM_DECKS_YAML)
    }

    pub fn load(registry_dir: Option<&Path>) -> anyhow::Result<Self> {
        let Some(dir) = registry_dir else {
            return Self::load_embedded();
        };

        let read = |file: &str, fallback: &str| -> String {
            std::fs::read_to_string(dir.join(file)).unwrap_or_else(|_| fallback.to_string())
        };

        Self::parse(
            &read("game_modes.yaml", GAME_MODES_YAML),
            &read("map_blocks.yaml", MAP_BLOCKS_YAML),
            &read("item_decks.yaml", ITEM_DECKS_YAML),
        )
    }

    fn parse(game_modes: &str, map_blocks: &str, item_decks: &str) -> anyhow::Result<Self> {
        let game_modes: GameModesFile =
            serde_yaml::from_str(game_modes).context("parse game modes table")?;
        let map_blocks: MapBlocksFile =
            serde_yaml::from_str(map_blocks).context("parse map blocks table")?;
        let item_decks: ItemDecksFile =
            serde_yaml::from_str(item_decks).context("parse item decks table")?;

        Ok(Self {
            game_modes: game_modes
                .game_modes
                .into_iter()
                .map(|m| (m.id, m))
                .collect(),
            map_blocks: map_blocks
                .map_blocks
                .into_iter()
                .map(|m| (m.id, m))
                .collect(),
            item_decks: item_decks
                .item_decks
                .into_iter()
                .map(|d| (d.id, d))
                .collect(),
        })
    }

    pub fn game_mode_info(&self, mode: u8) -> anyhow::Result<&GameModeInfo> {
        self.game_modes
            .get(&mode)
            .with_context(|| format!("unknown game mode {mode}"))
    }

    pub fn map_block_info(&self, map_block_id: u16) -> anyhow::Result<&MapBlockInfo> {
        self.map_blocks
            .get(&map_block_id)
            .with_context(|| format!("unknown map block {map_block_id}"))
    }

    pub fn item_deck(&self, deck_id: u32) -> Option<&ItemDeckInfo> {
        self.item_decks.get(&deck_id)
    }
}

/// Builds the randomized look of a newly created horse.
pub struct HorseRegistry;

impl HorseRegistry {
    pub fn build_random_horse(parts: &mut HorseParts, appearance: &mut HorseAppearance) {
        let mut rng = rand::thread_rng();
        parts.skin_id = rng.gen_range(1..=8);
        parts.mane_id = rng.gen_range(1..=5);
        parts.tail_id = rng.gen_range(1..=5);
        parts.face_id = rng.gen_range(1..=4);
        appearance.scale = rng.gen_range(4..=7);
        appearance.leg_length = rng.gen_range(4..=7);
        appearance.leg_volume = rng.gen_range(4..=7);
        appearance.body_length = rng.gen_range(4..=7);
        appearance.body_volume = rng.gen_range(4..=7);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tables_parse() {
        let registry = CourseRegistry::load_embedded().unwrap();

        let speed = registry.game_mode_info(1).unwrap();
        assert_eq!(speed.star_points_max, 40_000);
        assert_eq!(speed.perfect_jump_max_bonus_combo, 5);
        assert!(!speed.map_pool.is_empty());

        let magic = registry.game_mode_info(2).unwrap();
        assert!(magic.used_deck_item_ids.contains(&103));

        assert!(registry.game_mode_info(99).is_err());
    }

    #[test]
    fn map_blocks_reference_known_decks() {
        let registry = CourseRegistry::load_embedded().unwrap();
        for map_block_id in [1u16, 2, 3, 4, 5, 6, 7] {
            let block = registry.map_block_info(map_block_id).unwrap();
            for spawn in &block.deck_items {
                assert!(
                    registry.item_deck(spawn.deck_id).is_some(),
                    "map {map_block_id} references unknown deck {}",
                    spawn.deck_id
                );
            }
        }
    }

    #[test]
    fn map_pools_reference_known_maps() {
        let registry = CourseRegistry::load_embedded().unwrap();
        for mode in [1u8, 2, 3, 6] {
            for map_block_id in &registry.game_mode_info(mode).unwrap().map_pool {
                assert!(registry.map_block_info(*map_block_id).is_ok());
            }
        }
    }

    #[test]
    fn random_horse_stays_in_range() {
        for _ in 0..50 {
            let mut parts = HorseParts::default();
            let mut appearance = HorseAppearance::default();
            HorseRegistry::build_random_horse(&mut parts, &mut appearance);
            assert!((1..=8).contains(&parts.skin_id));
            assert!((4..=7).contains(&appearance.scale));
        }
    }
}
