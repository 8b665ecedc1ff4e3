use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Instant;

use canterproto::common::{Oid, Uid, INVALID_OID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacerState {
    Disconnected,
    Loading,
    Racing,
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RacerTeam {
    #[default]
    Solo,
    Red,
    Blue,
}

/// Per-racer transient race state.
#[derive(Debug, Clone)]
pub struct Racer {
    pub oid: Oid,
    pub state: RacerState,
    pub team: RacerTeam,
    pub star_point_value: u32,
    pub jump_combo_value: u32,
    pub course_time: u32,
    pub magic_item: Option<u32>,
    /// Items currently spawned on this racer's client.
    pub tracked_items: HashSet<Oid>,
    pub is_targeting: bool,
    pub current_target: Oid,
}

/// A pickup placed on the course.
#[derive(Debug, Clone)]
pub struct Item {
    pub oid: Oid,
    pub deck_id: u32,
    pub respawn_at: Instant,
    pub position: [f32; 3],
}

/// Transient state of one race: racers and items under race-local oids.
///
/// Oids are assigned monotonically from 1 and never reused within the race;
/// removal is a state update, not an id recycle.
#[derive(Debug, Default)]
pub struct RaceTracker {
    next_racer_oid: Oid,
    racers: BTreeMap<Uid, Racer>,
    next_item_oid: Oid,
    items: BTreeMap<Oid, Item>,
}

impl RaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_racer(&mut self, character_uid: Uid) -> &mut Racer {
        self.next_racer_oid += 1;
        let oid = self.next_racer_oid;
        self.racers.entry(character_uid).or_insert_with(|| Racer {
            oid,
            state: RacerState::Disconnected,
            team: RacerTeam::Solo,
            star_point_value: 0,
            jump_combo_value: 0,
            course_time: u32::MAX,
            magic_item: None,
            tracked_items: HashSet::new(),
            is_targeting: false,
            current_target: INVALID_OID,
        })
    }

    pub fn remove_racer(&mut self, character_uid: Uid) {
        self.racers.remove(&character_uid);
    }

    pub fn is_racer(&self, character_uid: Uid) -> bool {
        self.racers.contains_key(&character_uid)
    }

    pub fn racer(&self, character_uid: Uid) -> Option<&Racer> {
        self.racers.get(&character_uid)
    }

    pub fn racer_mut(&mut self, character_uid: Uid) -> Option<&mut Racer> {
        self.racers.get_mut(&character_uid)
    }

    pub fn racers(&self) -> &BTreeMap<Uid, Racer> {
        &self.racers
    }

    pub fn racers_mut(&mut self) -> &mut BTreeMap<Uid, Racer> {
        &mut self.racers
    }

    pub fn racer_by_oid_mut(&mut self, oid: Oid) -> Option<(&Uid, &mut Racer)> {
        self.racers.iter_mut().find(|(_, racer)| racer.oid == oid)
    }

    pub fn add_item(&mut self, deck_id: u32, position: [f32; 3]) -> &mut Item {
        self.next_item_oid += 1;
        let oid = self.next_item_oid;
        self.items.entry(oid).or_insert_with(|| Item {
            oid,
            deck_id,
            respawn_at: Instant::now(),
            position,
        })
    }

    pub fn item(&self, oid: Oid) -> Option<&Item> {
        self.items.get(&oid)
    }

    pub fn item_mut(&mut self, oid: Oid) -> Option<&mut Item> {
        self.items.get_mut(&oid)
    }

    pub fn items(&self) -> &BTreeMap<Oid, Item> {
        &self.items
    }

    pub fn clear(&mut self) {
        self.next_racer_oid = 0;
        self.next_item_oid = 0;
        self.racers.clear();
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oids_are_monotonic_from_one() {
        let mut tracker = RaceTracker::new();
        assert_eq!(tracker.add_racer(100).oid, 1);
        assert_eq!(tracker.add_racer(200).oid, 2);
        assert_eq!(tracker.add_racer(300).oid, 3);
    }

    #[test]
    fn removal_does_not_reuse_oids() {
        let mut tracker = RaceTracker::new();
        tracker.add_racer(100);
        tracker.add_racer(200);
        tracker.remove_racer(100);

        assert_eq!(tracker.add_racer(300).oid, 3);
        let mut oids: Vec<Oid> = tracker.racers().values().map(|r| r.oid).collect();
        oids.sort_unstable();
        assert_eq!(oids, vec![2, 3]);
    }

    #[test]
    fn item_oids_are_independent_of_racer_oids() {
        let mut tracker = RaceTracker::new();
        tracker.add_racer(100);
        let item_oid = tracker.add_item(101, [0.0, 0.0, 0.0]).oid;
        assert_eq!(item_oid, 1);
    }

    #[test]
    fn clear_resets_oid_counters() {
        let mut tracker = RaceTracker::new();
        tracker.add_racer(100);
        tracker.add_item(101, [0.0; 3]);
        tracker.clear();

        assert!(tracker.racers().is_empty());
        assert!(tracker.items().is_empty());
        assert_eq!(tracker.add_racer(100).oid, 1);
    }

    #[test]
    fn new_racer_defaults() {
        let mut tracker = RaceTracker::new();
        let racer = tracker.add_racer(100);
        assert_eq!(racer.state, RacerState::Disconnected);
        assert_eq!(racer.course_time, u32::MAX);
        assert!(racer.magic_item.is_none());
        assert!(!racer.is_targeting);
    }
}
