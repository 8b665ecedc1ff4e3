use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use canterproto::common::Uid;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    Speed,
    Magic,
    Guild,
    Tutorial,
}

impl Default for GameMode {
    fn default() -> Self {
        GameMode::Speed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeamMode {
    #[default]
    Solo,
    Team,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerTeam {
    #[default]
    Solo,
    Red,
    Blue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Player {
    is_ready: bool,
    team: PlayerTeam,
}

impl Player {
    pub fn toggle_ready(&mut self) -> bool {
        self.is_ready = !self.is_ready;
        self.is_ready
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn set_team(&mut self, team: PlayerTeam) {
        self.team = team;
    }

    pub fn team(&self) -> PlayerTeam {
        self.team
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomDetails {
    pub name: String,
    pub password: String,
    pub mission_id: u16,
    pub course_id: u16,
    pub max_player_count: u32,
    pub game_mode: GameMode,
    pub team_mode: TeamMode,
    pub npc_race: bool,
    pub skill_bracket: u8,
}

#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub uid: Uid,
    pub details: RoomDetails,
    pub player_count: usize,
    pub is_playing: bool,
}

/// A matchmaking room. Queued players hold a seat while they travel from
/// the lobby to the race endpoint; admission moves them to the committed
/// set atomically.
#[derive(Debug)]
pub struct Room {
    uid: Uid,
    details: RoomDetails,
    queued_players: HashSet<Uid>,
    players: HashMap<Uid, Player>,
    is_playing: bool,
}

impl Room {
    fn new(uid: Uid) -> Self {
        Self {
            uid,
            details: RoomDetails::default(),
            queued_players: HashSet::new(),
            players: HashMap::new(),
            is_playing: false,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn details(&self) -> &RoomDetails {
        &self.details
    }

    pub fn details_mut(&mut self) -> &mut RoomDetails {
        &mut self.details
    }

    pub fn is_full(&self) -> bool {
        self.players.len() + self.queued_players.len() >= self.details.max_player_count as usize
    }

    pub fn queue_player(&mut self, character_uid: Uid) -> bool {
        if self.is_full() {
            return false;
        }
        self.queued_players.insert(character_uid);
        true
    }

    /// Removes a queued seat. Returns `false` when the player already
    /// committed (or never queued).
    pub fn dequeue_player(&mut self, character_uid: Uid) -> bool {
        self.queued_players.remove(&character_uid)
    }

    /// Commits a player, consuming their queued seat if they held one. In
    /// team mode the player lands on the smaller team, coin-flipping ties.
    pub fn add_player(&mut self, character_uid: Uid) -> bool {
        if self.players.len() >= self.details.max_player_count as usize {
            return false;
        }

        let mut player = Player::default();
        if self.details.team_mode == TeamMode::Team {
            let red = self
                .players
                .values()
                .filter(|p| p.team() == PlayerTeam::Red)
                .count();
            let blue = self
                .players
                .values()
                .filter(|p| p.team() == PlayerTeam::Blue)
                .count();

            let team = match red.cmp(&blue) {
                std::cmp::Ordering::Greater => PlayerTeam::Blue,
                std::cmp::Ordering::Less => PlayerTeam::Red,
                std::cmp::Ordering::Equal => {
                    if rand::thread_rng().gen_bool(0.5) {
                        PlayerTeam::Red
                    } else {
                        PlayerTeam::Blue
                    }
                }
            };
            player.set_team(team);
        }

        self.queued_players.remove(&character_uid);
        self.players.entry(character_uid).or_insert(player);
        true
    }

    pub fn remove_player(&mut self, character_uid: Uid) {
        self.players.remove(&character_uid);
    }

    pub fn player(&self, character_uid: Uid) -> Option<&Player> {
        self.players.get(&character_uid)
    }

    pub fn player_mut(&mut self, character_uid: Uid) -> Option<&mut Player> {
        self.players.get_mut(&character_uid)
    }

    pub fn players(&self) -> &HashMap<Uid, Player> {
        &self.players
    }

    pub fn queued_players(&self) -> &HashSet<Uid> {
        &self.queued_players
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.is_playing = playing;
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            uid: self.uid,
            details: self.details.clone(),
            player_count: self.players.len(),
            is_playing: self.is_playing,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RoomError {
    Missing(Uid),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Missing(uid) => write!(f, "room {uid} does not exist"),
        }
    }
}

impl std::error::Error for RoomError {}

/// Process-wide room registry.
///
/// Two-level locking: the map lock guards the collection, a per-room lock
/// guards each room's contents. Lookups release the map lock before taking
/// the room lock, so holding a room never blocks the registry.
#[derive(Default)]
pub struct RoomSystem {
    next_uid: Mutex<Uid>,
    rooms: Mutex<HashMap<Uid, Arc<Mutex<Room>>>>,
}

impl RoomSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh room and runs `configure` under its lock before the
    /// room becomes visible to `get_rooms_snapshot` callers with meaningful
    /// content. Returns the room uid.
    pub fn create_room<R>(&self, configure: impl FnOnce(&mut Room) -> R) -> (Uid, R) {
        let uid = {
            let mut next = self.next_uid.lock().unwrap();
            *next += 1;
            *next
        };

        let entry = Arc::new(Mutex::new(Room::new(uid)));
        // Configure before publishing so a snapshot never observes a
        // half-constructed room.
        let result = configure(&mut entry.lock().unwrap());

        self.rooms.lock().unwrap().insert(uid, entry);
        (uid, result)
    }

    pub fn get_room<R>(
        &self,
        uid: Uid,
        consume: impl FnOnce(&mut Room) -> R,
    ) -> Result<R, RoomError> {
        let entry = {
            let rooms = self.rooms.lock().unwrap();
            rooms.get(&uid).cloned()
        };
        let entry = entry.ok_or(RoomError::Missing(uid))?;

        let mut room = entry.lock().unwrap();
        Ok(consume(&mut room))
    }

    pub fn room_exists(&self, uid: Uid) -> bool {
        self.rooms.lock().unwrap().contains_key(&uid)
    }

    pub fn get_rooms_snapshot(&self) -> Vec<RoomSnapshot> {
        let entries: Vec<Arc<Mutex<Room>>> = {
            let rooms = self.rooms.lock().unwrap();
            rooms.values().cloned().collect()
        };

        let mut snapshots: Vec<RoomSnapshot> =
            entries.iter().map(|e| e.lock().unwrap().snapshot()).collect();
        snapshots.sort_by_key(|s| s.uid);
        snapshots
    }

    pub fn delete_room(&self, uid: Uid) -> Result<(), RoomError> {
        match self.rooms.lock().unwrap().remove(&uid) {
            Some(_) => Ok(()),
            None => Err(RoomError::Missing(uid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_room(system: &RoomSystem, max_players: u32) -> Uid {
        let (uid, _) = system.create_room(|room| {
            room.details_mut().name = "test".to_string();
            room.details_mut().max_player_count = max_players;
        });
        uid
    }

    #[test]
    fn uids_are_strictly_increasing_and_nonzero() {
        let system = RoomSystem::new();
        let a = make_room(&system, 8);
        let b = make_room(&system, 8);
        let c = make_room(&system, 8);
        assert!(a > 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn queue_then_add_moves_player() {
        let system = RoomSystem::new();
        let uid = make_room(&system, 8);

        system
            .get_room(uid, |room| {
                assert!(room.queue_player(42));
                assert!(room.queued_players().contains(&42));
                assert!(room.add_player(42));
                assert!(!room.queued_players().contains(&42));
                assert!(room.player(42).is_some());
            })
            .unwrap();
    }

    #[test]
    fn occupancy_counts_queued_and_committed() {
        let system = RoomSystem::new();
        let uid = make_room(&system, 2);

        system
            .get_room(uid, |room| {
                assert!(room.queue_player(1));
                assert!(room.add_player(1));
                assert!(room.queue_player(2));
                // Queued seat holds the slot.
                assert!(room.is_full());
                assert!(!room.queue_player(3));
                assert!(room.add_player(2));
                assert!(!room.add_player(3));
            })
            .unwrap();
    }

    #[test]
    fn team_mode_balances_teams() {
        let system = RoomSystem::new();
        let uid = make_room(&system, 8);

        system
            .get_room(uid, |room| {
                room.details_mut().team_mode = TeamMode::Team;
                for character in 1..=6u32 {
                    assert!(room.add_player(character));
                }
                let red = room
                    .players()
                    .values()
                    .filter(|p| p.team() == PlayerTeam::Red)
                    .count();
                let blue = room
                    .players()
                    .values()
                    .filter(|p| p.team() == PlayerTeam::Blue)
                    .count();
                assert_eq!(red, 3);
                assert_eq!(blue, 3);
            })
            .unwrap();
    }

    #[test]
    fn missing_room_is_an_error() {
        let system = RoomSystem::new();
        assert!(system.get_room(99, |_| ()).is_err());
        assert!(system.delete_room(99).is_err());
        assert!(!system.room_exists(99));
    }

    #[test]
    fn snapshot_lists_fully_constructed_rooms() {
        let system = RoomSystem::new();
        let uid = make_room(&system, 8);

        let snapshots = system.get_rooms_snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].uid, uid);
        assert_eq!(snapshots[0].details.name, "test");
        assert!(!snapshots[0].is_playing);
    }

    #[test]
    fn delete_room_removes_it() {
        let system = RoomSystem::new();
        let uid = make_room(&system, 8);
        system.delete_room(uid).unwrap();
        assert!(!system.room_exists(uid));
        assert!(system.get_rooms_snapshot().is_empty());
    }
}
