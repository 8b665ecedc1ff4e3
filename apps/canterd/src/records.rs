use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use canterproto::common::{Uid, INVALID_UID};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub character_uid: Uid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    #[default]
    User,
    PowerUser,
    GameMaster,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CharacterParts {
    pub model_id: u8,
    pub mouth_id: u8,
    pub face_id: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CharacterAppearance {
    pub voice_id: u8,
    pub head_size: u8,
    pub height: u8,
    pub thigh_volume: u8,
    pub leg_volume: u8,
    pub emblem_id: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SkillSet {
    pub slot1: u32,
    pub slot2: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SkillSets {
    /// Which of the two sets is active: 0 or 1.
    pub active_set_id: u8,
    pub set1: SkillSet,
    pub set2: SkillSet,
}

impl SkillSets {
    pub fn active(&self) -> SkillSet {
        if self.active_set_id == 1 {
            self.set2
        } else {
            self.set1
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CharacterSkills {
    pub speed: SkillSets,
    pub magic: SkillSets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub uid: Uid,
    pub name: String,
    #[serde(default)]
    pub gender: u8,
    pub level: u16,
    pub carrots: u32,
    #[serde(default)]
    pub cash: u32,
    #[serde(default)]
    pub role: CharacterRole,
    #[serde(default)]
    pub introduction: String,
    #[serde(default)]
    pub mount_uid: Uid,
    #[serde(default)]
    pub horses: Vec<Uid>,
    #[serde(default)]
    pub inventory: Vec<Uid>,
    #[serde(default)]
    pub character_equipment: Vec<Uid>,
    #[serde(default)]
    pub mount_equipment: Vec<Uid>,
    #[serde(default)]
    pub settings_uid: Uid,
    #[serde(default)]
    pub guild_uid: Uid,
    #[serde(default)]
    pub pet_uid: Uid,
    #[serde(default)]
    pub is_ranch_locked: bool,
    #[serde(default)]
    pub parts: CharacterParts,
    #[serde(default)]
    pub appearance: CharacterAppearance,
    #[serde(default)]
    pub skills: CharacterSkills,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HorseParts {
    pub skin_id: u8,
    pub mane_id: u8,
    pub tail_id: u8,
    pub face_id: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HorseAppearance {
    pub scale: u8,
    pub leg_length: u8,
    pub leg_volume: u8,
    pub body_length: u8,
    pub body_volume: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Horse {
    pub uid: Uid,
    pub tid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parts: HorseParts,
    #[serde(default)]
    pub appearance: HorseAppearance,
    #[serde(default)]
    pub stamina: u16,
    #[serde(default)]
    pub growth_points: u16,
    #[serde(default)]
    pub total_distance: u32,
    #[serde(default)]
    pub top_speed: u32,
    #[serde(default)]
    pub speed_wins: u32,
    #[serde(default)]
    pub magic_wins: u32,
    #[serde(default)]
    pub best_boost_combo: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub uid: Uid,
    pub tid: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub uid: Uid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner_uid: Uid,
    #[serde(default)]
    pub officers: Vec<Uid>,
    #[serde(default)]
    pub members: Vec<Uid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pet {
    pub uid: Uid,
    pub tid: u32,
    #[serde(default)]
    pub name: String,
}

/// A shared, reference-counted record.
///
/// Readers use [`Record::immutable`], writers [`Record::mutable`]; a writer
/// serializes with every concurrent reader of the same record. The closure
/// must not call back into the cache for the same record.
#[derive(Debug)]
pub struct Record<T>(Arc<RwLock<T>>);

impl<T> Clone for Record<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Record<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn immutable<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.read().unwrap())
    }

    pub fn mutable<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.write().unwrap())
    }
}

/// Key → record map with availability tracking. The cache is the sole owner
/// of loaded records.
#[derive(Debug)]
pub struct RecordCache<K, T> {
    entries: Mutex<HashMap<K, Record<T>>>,
}

impl<K: std::hash::Hash + Eq + Clone, T> RecordCache<K, T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Record<T>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn get_many(&self, keys: &[K]) -> Vec<Record<T>> {
        let entries = self.entries.lock().unwrap();
        keys.iter().filter_map(|k| entries.get(k).cloned()).collect()
    }

    pub fn insert(&self, key: K, value: T) -> Record<T> {
        let record = Record::new(value);
        self.entries
            .lock()
            .unwrap()
            .insert(key, record.clone());
        record
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

/// The persistence collaborator. Concrete storage is outside the server
/// core; the server only ever sees this contract.
pub trait RecordStore: Send + Sync + 'static {
    fn load_user(&self, name: &str) -> Option<User>;
    fn load_character(&self, uid: Uid) -> Option<Character>;
    fn load_horse(&self, uid: Uid) -> Option<Horse>;
    fn load_item(&self, uid: Uid) -> Option<ItemRecord>;
    fn load_guild(&self, uid: Uid) -> Option<Guild>;
    fn load_pet(&self, uid: Uid) -> Option<Pet>;
    /// Highest uid in use, for seeding the allocator.
    fn max_uid(&self) -> Uid;
}

/// JSON-file record store: one array file per collection under a data
/// directory. Records are read once at startup.
pub struct JsonStore {
    users: HashMap<String, User>,
    characters: HashMap<Uid, Character>,
    horses: HashMap<Uid, Horse>,
    items: HashMap<Uid, ItemRecord>,
    guilds: HashMap<Uid, Guild>,
    pets: HashMap<Uid, Pet>,
}

fn read_collection<T: DeserializeOwned>(dir: &Path, file: &str) -> Vec<T> {
    let path: PathBuf = dir.join(file);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "bad record file");
            Vec::new()
        }
    }
}

impl JsonStore {
    pub fn load(dir: &Path) -> Self {
        Self {
            users: read_collection::<User>(dir, "users.json")
                .into_iter()
                .map(|u| (u.name.clone(), u))
                .collect(),
            characters: read_collection::<Character>(dir, "characters.json")
                .into_iter()
                .map(|c| (c.uid, c))
                .collect(),
            horses: read_collection::<Horse>(dir, "horses.json")
                .into_iter()
                .map(|h| (h.uid, h))
                .collect(),
            items: read_collection::<ItemRecord>(dir, "items.json")
                .into_iter()
                .map(|i| (i.uid, i))
                .collect(),
            guilds: read_collection::<Guild>(dir, "guilds.json")
                .into_iter()
                .map(|g| (g.uid, g))
                .collect(),
            pets: read_collection::<Pet>(dir, "pets.json")
                .into_iter()
                .map(|p| (p.uid, p))
                .collect(),
        }
    }
}

impl RecordStore for JsonStore {
    fn load_user(&self, name: &str) -> Option<User> {
        self.users.get(name).cloned()
    }

    fn load_character(&self, uid: Uid) -> Option<Character> {
        self.characters.get(&uid).cloned()
    }

    fn load_horse(&self, uid: Uid) -> Option<Horse> {
        self.horses.get(&uid).cloned()
    }

    fn load_item(&self, uid: Uid) -> Option<ItemRecord> {
        self.items.get(&uid).cloned()
    }

    fn load_guild(&self, uid: Uid) -> Option<Guild> {
        self.guilds.get(&uid).cloned()
    }

    fn load_pet(&self, uid: Uid) -> Option<Pet> {
        self.pets.get(&uid).cloned()
    }

    fn max_uid(&self) -> Uid {
        let mut max = 0;
        for uid in self
            .characters
            .keys()
            .chain(self.horses.keys())
            .chain(self.items.keys())
            .chain(self.guilds.keys())
            .chain(self.pets.keys())
        {
            max = max.max(*uid);
        }
        max
    }
}

/// The record cache front: asynchronous loads with availability flags, plus
/// typed caches the directors read and write through.
///
/// Loads run on the runtime and are never cancelled; a client that
/// disconnects mid-load simply is not around when the data arrive.
pub struct DataDirector {
    store: Arc<dyn RecordStore>,
    weak: std::sync::Weak<Self>,
    loading: Mutex<HashSet<String>>,
    next_uid: AtomicU32,
    pub users: RecordCache<String, User>,
    pub characters: RecordCache<Uid, Character>,
    pub horses: RecordCache<Uid, Horse>,
    pub items: RecordCache<Uid, ItemRecord>,
    pub guilds: RecordCache<Uid, Guild>,
    pub pets: RecordCache<Uid, Pet>,
}

impl DataDirector {
    pub fn new(store: Arc<dyn RecordStore>) -> Arc<Self> {
        let next_uid = store.max_uid() + 1;
        Arc::new_cyclic(|weak| Self {
            store,
            weak: weak.clone(),
            loading: Mutex::new(HashSet::new()),
            next_uid: AtomicU32::new(next_uid),
            users: RecordCache::new(),
            characters: RecordCache::new(),
            horses: RecordCache::new(),
            items: RecordCache::new(),
            guilds: RecordCache::new(),
            pets: RecordCache::new(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("data director alive")
    }

    pub fn allocate_uid(&self) -> Uid {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn are_data_being_loaded(&self, user_name: &str) -> bool {
        self.loading.lock().unwrap().contains(user_name)
    }

    pub fn are_user_data_loaded(&self, user_name: &str) -> bool {
        self.users.contains(&user_name.to_owned())
    }

    pub fn are_character_data_loaded(&self, user_name: &str) -> bool {
        let Some(user) = self.users.get(&user_name.to_owned()) else {
            return false;
        };
        let character_uid = user.immutable(|u| u.character_uid);
        character_uid != INVALID_UID && self.characters.contains(&character_uid)
    }

    /// Requests the user record load. Idempotent while a load is in flight.
    pub fn request_load_user_data(&self, user_name: String) {
        if !self.loading.lock().unwrap().insert(user_name.clone()) {
            return;
        }

        let this = self.arc();
        tokio::spawn(async move {
            if let Some(user) = this.store.load_user(&user_name) {
                this.users.insert(user_name.clone(), user);
            }
            this.loading.lock().unwrap().remove(&user_name);
        });
    }

    /// Requests the character record load together with everything it
    /// references: horses, inventory and equipment items, guild, pet.
    pub fn request_load_character_data(&self, user_name: String, character_uid: Uid) {
        if !self.loading.lock().unwrap().insert(user_name.clone()) {
            return;
        }

        let this = self.arc();
        tokio::spawn(async move {
            if let Some(character) = this.store.load_character(character_uid) {
                let mut horse_uids = character.horses.clone();
                if character.mount_uid != INVALID_UID {
                    horse_uids.push(character.mount_uid);
                }
                for uid in horse_uids {
                    if let Some(horse) = this.store.load_horse(uid) {
                        this.horses.insert(uid, horse);
                    }
                }

                let item_uids = character
                    .inventory
                    .iter()
                    .chain(&character.character_equipment)
                    .chain(&character.mount_equipment)
                    .copied()
                    .collect::<Vec<_>>();
                for uid in item_uids {
                    if let Some(item) = this.store.load_item(uid) {
                        this.items.insert(uid, item);
                    }
                }

                if character.guild_uid != INVALID_UID {
                    if let Some(guild) = this.store.load_guild(character.guild_uid) {
                        this.guilds.insert(character.guild_uid, guild);
                    }
                }
                if character.pet_uid != INVALID_UID {
                    if let Some(pet) = this.store.load_pet(character.pet_uid) {
                        this.pets.insert(character.pet_uid, pet);
                    }
                }

                this.characters.insert(character_uid, character);
            } else {
                warn!(character = character_uid, "character record missing in store");
            }
            this.loading.lock().unwrap().remove(&user_name);
        });
    }

    pub fn user(&self, user_name: &str) -> Option<Record<User>> {
        self.users.get(&user_name.to_owned())
    }

    pub fn character(&self, uid: Uid) -> Option<Record<Character>> {
        self.characters.get(&uid)
    }

    pub fn horse(&self, uid: Uid) -> Option<Record<Horse>> {
        self.horses.get(&uid)
    }

    pub fn guild(&self, uid: Uid) -> Option<Record<Guild>> {
        self.guilds.get(&uid)
    }

    pub fn pet(&self, uid: Uid) -> Option<Record<Pet>> {
        self.pets.get(&uid)
    }

    pub fn create_horse(&self, build: impl FnOnce(&mut Horse)) -> Record<Horse> {
        let uid = self.allocate_uid();
        let mut horse = Horse {
            uid,
            tid: 0,
            name: String::new(),
            parts: HorseParts::default(),
            appearance: HorseAppearance::default(),
            stamina: 0,
            growth_points: 0,
            total_distance: 0,
            top_speed: 0,
            speed_wins: 0,
            magic_wins: 0,
            best_boost_combo: 0,
        };
        build(&mut horse);
        horse.uid = uid;
        self.horses.insert(uid, horse.clone())
    }

    pub fn create_character(&self, build: impl FnOnce(&mut Character)) -> Record<Character> {
        let uid = self.allocate_uid();
        let mut character = Character {
            uid,
            name: String::new(),
            gender: 0,
            level: 1,
            carrots: 0,
            cash: 0,
            role: CharacterRole::User,
            introduction: String::new(),
            mount_uid: INVALID_UID,
            horses: Vec::new(),
            inventory: Vec::new(),
            character_equipment: Vec::new(),
            mount_equipment: Vec::new(),
            settings_uid: INVALID_UID,
            guild_uid: INVALID_UID,
            pet_uid: INVALID_UID,
            is_ranch_locked: false,
            parts: CharacterParts::default(),
            appearance: CharacterAppearance::default(),
            skills: CharacterSkills::default(),
        };
        build(&mut character);
        character.uid = uid;
        self.characters.insert(uid, character.clone())
    }
}

/// In-memory store for tests and empty deployments.
#[derive(Default)]
pub struct MemoryStore {
    pub users: Mutex<HashMap<String, User>>,
    pub characters: Mutex<HashMap<Uid, Character>>,
    pub horses: Mutex<HashMap<Uid, Horse>>,
}

impl RecordStore for MemoryStore {
    fn load_user(&self, name: &str) -> Option<User> {
        self.users.lock().unwrap().get(name).cloned()
    }

    fn load_character(&self, uid: Uid) -> Option<Character> {
        self.characters.lock().unwrap().get(&uid).cloned()
    }

    fn load_horse(&self, uid: Uid) -> Option<Horse> {
        self.horses.lock().unwrap().get(&uid).cloned()
    }

    fn load_item(&self, _uid: Uid) -> Option<ItemRecord> {
        None
    }

    fn load_guild(&self, _uid: Uid) -> Option<Guild> {
        None
    }

    fn load_pet(&self, _uid: Uid) -> Option<Pet> {
        None
    }

    fn max_uid(&self) -> Uid {
        let characters = self.characters.lock().unwrap();
        let horses = self.horses.lock().unwrap();
        characters
            .keys()
            .chain(horses.keys())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(name: &str, character_uid: Uid) -> User {
        User {
            name: name.to_string(),
            token: "T".to_string(),
            character_uid,
        }
    }

    fn test_character(uid: Uid, name: &str) -> Character {
        let mut character = Character {
            uid,
            name: name.to_string(),
            gender: 0,
            level: 60,
            carrots: 10_000,
            cash: 0,
            role: CharacterRole::User,
            introduction: String::new(),
            mount_uid: INVALID_UID,
            horses: Vec::new(),
            inventory: Vec::new(),
            character_equipment: Vec::new(),
            mount_equipment: Vec::new(),
            settings_uid: INVALID_UID,
            guild_uid: INVALID_UID,
            pet_uid: INVALID_UID,
            is_ranch_locked: false,
            parts: CharacterParts::default(),
            appearance: CharacterAppearance::default(),
            skills: CharacterSkills::default(),
        };
        character.skills.speed.set1 = SkillSet { slot1: 1, slot2: 2 };
        character
    }

    async fn settle(data: &Arc<DataDirector>, user: &str) {
        for _ in 0..1000 {
            if !data.are_data_being_loaded(user) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("load never settled");
    }

    #[tokio::test]
    async fn user_load_populates_cache() {
        let store = MemoryStore::default();
        store
            .users
            .lock()
            .unwrap()
            .insert("alice".to_string(), test_user("alice", 42));
        let data = DataDirector::new(Arc::new(store));

        assert!(!data.are_user_data_loaded("alice"));
        data.request_load_user_data("alice".to_string());
        settle(&data, "alice").await;

        assert!(data.are_user_data_loaded("alice"));
        let record = data.user("alice").unwrap();
        assert_eq!(record.immutable(|u| u.character_uid), 42);
    }

    #[tokio::test]
    async fn missing_user_load_completes_without_data() {
        let data = DataDirector::new(Arc::new(MemoryStore::default()));
        data.request_load_user_data("ghost".to_string());
        settle(&data, "ghost").await;
        assert!(!data.are_user_data_loaded("ghost"));
    }

    #[tokio::test]
    async fn character_load_pulls_referenced_horses() {
        let store = MemoryStore::default();
        store
            .users
            .lock()
            .unwrap()
            .insert("alice".to_string(), test_user("alice", 42));
        let mut character = test_character(42, "alice");
        character.mount_uid = 7;
        store.characters.lock().unwrap().insert(42, character);
        store.horses.lock().unwrap().insert(
            7,
            Horse {
                uid: 7,
                tid: 20002,
                name: "star".to_string(),
                parts: HorseParts::default(),
                appearance: HorseAppearance::default(),
                stamina: 3500,
                growth_points: 150,
                total_distance: 0,
                top_speed: 0,
                speed_wins: 0,
                magic_wins: 0,
                best_boost_combo: 0,
            },
        );

        let data = DataDirector::new(Arc::new(store));
        data.request_load_user_data("alice".to_string());
        settle(&data, "alice").await;
        data.request_load_character_data("alice".to_string(), 42);
        settle(&data, "alice").await;

        assert!(data.are_character_data_loaded("alice"));
        let horse = data.horse(7).unwrap();
        assert_eq!(horse.immutable(|h| h.name.clone()), "star");
    }

    #[tokio::test]
    async fn created_records_get_fresh_uids() {
        let store = MemoryStore::default();
        store
            .characters
            .lock()
            .unwrap()
            .insert(42, test_character(42, "alice"));
        let data = DataDirector::new(Arc::new(store));

        let horse = data.create_horse(|h| h.tid = 20002);
        let uid = horse.immutable(|h| h.uid);
        assert!(uid > 42);

        let character = data.create_character(|c| c.name = "bob".to_string());
        assert!(character.immutable(|c| c.uid) > uid);
    }

    #[test]
    fn record_mutation_is_visible_to_readers() {
        let record = Record::new(test_character(1, "alice"));
        record.mutable(|c| c.carrots = 99);
        assert_eq!(record.immutable(|c| c.carrots), 99);
    }
}
