use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use std::time::Instant;

use canterproto::common::{
    GameMode as ProtoGameMode, Oid, Racer as ProtoRacer, TeamColor, TeamMode as ProtoTeamMode,
    Uid, INVALID_OID, INVALID_UID,
};
use canterproto::race::*;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::net::{ClientId, CommandServer, ServerEvents};
use crate::otp;
use crate::protohelp;
use crate::rooms;
use crate::scheduler::Scheduler;
use crate::tracker::{RaceTracker, RacerState, RacerTeam};

const LOADING_TIMEOUT: Duration = Duration::from_secs(30);
const FINISHING_TIMEOUT: Duration = Duration::from_secs(15);
const ROOM_COUNTDOWN_MS: u32 = 3000;

/// How close a racer must be before an item spawns on their client.
const ITEM_SPAWN_DISTANCE: f32 = 90.0;

/// Magic gauge regeneration per position update while racing empty-handed.
const NO_ITEM_HELD_BOOST_AMOUNT: u32 = 2000;

/// The magic item roll: bolt, shield, ice wall.
const MAGIC_ITEMS: [u32; 3] = [2, 4, 10];
const MAGIC_ITEM_BOLT: u32 = 2;
const MAGIC_ITEM_ICE_WALL: u32 = 10;

/// Wire deck id the ice wall spawns as.
const ICE_WALL_DECK_ID: u32 = 102;
const ICE_WALL_POSITION: [f32; 3] = [25.0, -25.0, -8010.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Waiting,
    Loading,
    Racing,
    Finishing,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClientContext {
    character_uid: Uid,
    room_uid: Uid,
    is_authenticated: bool,
}

struct RaceInstance {
    stage: Stage,
    stage_timeout_at: Instant,
    master_uid: Uid,
    tracker: RaceTracker,
    game_mode: rooms::GameMode,
    team_mode: rooms::TeamMode,
    map_block_id: u16,
    mission_id: u16,
    race_start_at: Instant,
    clients: HashSet<ClientId>,
}

impl RaceInstance {
    fn new(master_uid: Uid) -> Self {
        Self {
            stage: Stage::Waiting,
            stage_timeout_at: Instant::now(),
            master_uid,
            tracker: RaceTracker::new(),
            game_mode: rooms::GameMode::Speed,
            team_mode: rooms::TeamMode::Solo,
            map_block_id: 0,
            mission_id: 0,
            race_start_at: Instant::now(),
            clients: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct RaceState {
    clients: HashMap<ClientId, ClientContext>,
    instances: HashMap<Uid, RaceInstance>,
    scheduler: Scheduler,
}

/// The race endpoint: rooms in their racing life, the authoritative stage
/// machine, scoring, and item/magic bookkeeping.
pub struct RaceDirector {
    ctx: Arc<ServerContext>,
    server: Arc<CommandServer>,
    weak: std::sync::Weak<Self>,
    state: Mutex<RaceState>,
}

/// Race clock: 100 ns units on the process-wide monotonic clock.
fn race_timestamp(at: Instant) -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    let delta = at.saturating_duration_since(epoch);
    (delta.as_nanos() / 100) as u64
}

fn random_magic_item() -> u32 {
    MAGIC_ITEMS[rand::thread_rng().gen_range(0..MAGIC_ITEMS.len())]
}

fn team_color(team: RacerTeam) -> TeamColor {
    match team {
        RacerTeam::Solo => TeamColor::None,
        RacerTeam::Red => TeamColor::Red,
        RacerTeam::Blue => TeamColor::Blue,
    }
}

fn room_team(team: rooms::PlayerTeam) -> RacerTeam {
    match team {
        rooms::PlayerTeam::Solo => RacerTeam::Solo,
        rooms::PlayerTeam::Red => RacerTeam::Red,
        rooms::PlayerTeam::Blue => RacerTeam::Blue,
    }
}

fn mode_id(mode: rooms::GameMode) -> u8 {
    match mode {
        rooms::GameMode::Speed => ProtoGameMode::Speed as u8,
        rooms::GameMode::Magic => ProtoGameMode::Magic as u8,
        rooms::GameMode::Guild => ProtoGameMode::Guild as u8,
        rooms::GameMode::Tutorial => ProtoGameMode::Tutorial as u8,
    }
}

impl RaceDirector {
    pub fn new(ctx: Arc<ServerContext>, server: Arc<CommandServer>) -> Arc<Self> {
        let director = Arc::new_cyclic(|weak| Self {
            ctx,
            server,
            weak: weak.clone(),
            state: Mutex::new(RaceState::default()),
        });

        director.register_handlers();
        director
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("race director alive")
    }

    fn register_handlers(&self) {
        macro_rules! handle {
            ($ty:ty, $method:ident) => {{
                let d = self.arc();
                self.server
                    .register_command_handler::<$ty>(move |client, command| {
                        d.$method(client, command)
                    });
            }};
        }

        handle!(AcCmdCREnterRoom, handle_enter_room);
        handle!(AcCmdCRChangeRoomOptions, handle_change_room_options);
        handle!(AcCmdCRChangeTeam, handle_change_team);
        handle!(AcCmdCRLeaveRoom, handle_leave_room_command);
        handle!(AcCmdCRReadyRace, handle_ready_race);
        handle!(AcCmdCRStartRace, handle_start_race);
        handle!(AcCmdUserRaceTimer, handle_race_timer);
        handle!(AcCmdCRLoadingComplete, handle_loading_complete);
        handle!(AcCmdUserRaceFinal, handle_user_race_final);
        handle!(AcCmdCRRaceResult, handle_race_result);
        handle!(AcCmdCRP2PResult, handle_p2p_result);
        handle!(AcCmdUserRaceP2PResult, handle_user_p2p_result);
        handle!(AcCmdCRAwardStart, handle_award_start);
        handle!(AcCmdCRAwardEnd, handle_award_end);
        handle!(AcCmdCRStarPointGet, handle_star_point_get);
        handle!(AcCmdCRRequestSpur, handle_request_spur);
        handle!(AcCmdCRHurdleClearResult, handle_hurdle_clear_result);
        handle!(AcCmdCRStartingRate, handle_starting_rate);
        handle!(AcCmdUserRaceUpdatePos, handle_race_user_pos);
        handle!(AcCmdCRChat, handle_chat);
        handle!(AcCmdCRRelayCommand, handle_relay_command);
        handle!(AcCmdCRRelay, handle_relay);
        handle!(
            AcCmdUserRaceActivateInteractiveEvent,
            handle_activate_interactive_event
        );
        handle!(AcCmdUserRaceActivateEvent, handle_activate_event);
        handle!(AcCmdCRRequestMagicItem, handle_request_magic_item);
        handle!(AcCmdCRUseMagicItem, handle_use_magic_item);
        handle!(AcCmdUserRaceItemGet, handle_race_item_get);
        handle!(AcCmdCRStartMagicTarget, handle_start_magic_target);
        handle!(
            AcCmdCRChangeMagicTargetNotify,
            handle_change_magic_target_notify
        );
        handle!(AcCmdCRChangeMagicTargetOK, handle_change_magic_target_ok);
        handle!(
            AcCmdCRChangeMagicTargetCancel,
            handle_change_magic_target_cancel
        );
        handle!(
            AcCmdCRChangeSkillCardPresetID,
            handle_change_skill_card_preset
        );
    }

    /// One tick of the race machine: fire due scheduled tasks, then advance
    /// every instance through its stage checks. Each instance transitions at
    /// most once per pass, and stages only ever move forward
    /// (Waiting → Loading → Racing → Finishing → Waiting).
    pub fn tick(&self) {
        let due = {
            let mut state = self.state.lock().unwrap();
            state.scheduler.drain_due(Instant::now())
        };
        for task in due {
            task();
        }

        self.tick_loading();
        self.tick_racing();
        self.tick_finishing();
    }

    fn tick_loading(&self) {
        let mut countdowns: Vec<(Vec<ClientId>, u64)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            for (room_uid, instance) in state.instances.iter_mut() {
                if instance.stage != Stage::Loading {
                    continue;
                }

                let all_loaded = instance.tracker.racers().values().all(|racer| {
                    racer.state == RacerState::Racing || racer.state == RacerState::Disconnected
                });
                let timed_out = now >= instance.stage_timeout_at;
                if !all_loaded && !timed_out {
                    continue;
                }

                if timed_out {
                    warn!(room = *room_uid, "loading timeout reached");
                }

                // Stragglers are treated as disconnected for this race.
                for racer in instance.tracker.racers_mut().values_mut() {
                    if racer.state != RacerState::Racing {
                        racer.state = RacerState::Disconnected;
                    }
                }

                let (time_limit, wait_time) =
                    match self.ctx.registry.map_block_info(instance.map_block_id) {
                        Ok(block) => (block.time_limit_s, block.wait_time_s),
                        Err(e) => {
                            warn!(room = *room_uid, err = %e, "map block missing; using defaults");
                            (180, 10)
                        }
                    };

                instance.stage = Stage::Racing;
                instance.stage_timeout_at = now + Duration::from_secs(time_limit);
                instance.race_start_at = now + Duration::from_secs(wait_time);

                countdowns.push((
                    instance.clients.iter().copied().collect(),
                    race_timestamp(instance.race_start_at),
                ));
            }
        }

        for (clients, race_start_timestamp) in countdowns {
            for client in clients {
                self.server.queue_command(client, move || AcCmdUserRaceCountdown {
                    race_start_timestamp,
                });
            }
        }
    }

    fn tick_racing(&self) {
        let mut finals: Vec<Vec<ClientId>> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let RaceState {
                clients, instances, ..
            } = &mut *state;

            for instance in instances.values_mut() {
                if instance.stage != Stage::Racing {
                    continue;
                }

                let any_finishing = instance
                    .tracker
                    .racers()
                    .values()
                    .any(|racer| racer.state == RacerState::Finishing);
                let timed_out = now >= instance.stage_timeout_at;
                if !any_finishing && !timed_out {
                    continue;
                }

                instance.stage = Stage::Finishing;
                instance.stage_timeout_at = now + FINISHING_TIMEOUT;

                // On a timeout every participant is told the race is over.
                if timed_out {
                    let participants = instance
                        .clients
                        .iter()
                        .copied()
                        .filter(|client| {
                            clients
                                .get(client)
                                .map(|context| instance.tracker.is_racer(context.character_uid))
                                .unwrap_or(false)
                        })
                        .collect();
                    finals.push(participants);
                }
            }
        }

        for participants in finals {
            for client in participants {
                self.server
                    .queue_command(client, AcCmdUserRaceFinalNotify::default);
            }
        }
    }

    fn tick_finishing(&self) {
        struct Finished {
            room_uid: Uid,
            clients: Vec<ClientId>,
            scoreboard: Vec<(Uid, u32, bool)>,
        }

        let mut finished: Vec<Finished> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            for (room_uid, instance) in state.instances.iter_mut() {
                if instance.stage != Stage::Finishing {
                    continue;
                }

                let all_done = instance.tracker.racers().values().all(|racer| {
                    racer.state == RacerState::Finishing
                        || racer.state == RacerState::Disconnected
                });
                let timed_out = now >= instance.stage_timeout_at;
                if !all_done && !timed_out {
                    continue;
                }

                if timed_out {
                    warn!(room = *room_uid, "finishing timeout reached");
                }

                let mut scoreboard: Vec<(Uid, u32, bool)> = instance
                    .tracker
                    .racers()
                    .iter()
                    .map(|(character_uid, racer)| {
                        let connected = racer.state != RacerState::Disconnected;
                        let course_time = if connected { racer.course_time } else { u32::MAX };
                        (*character_uid, course_time, connected)
                    })
                    .collect();
                scoreboard.sort_by_key(|(uid, course_time, _)| (*course_time, *uid));

                instance.stage = Stage::Waiting;
                finished.push(Finished {
                    room_uid: *room_uid,
                    clients: instance.clients.iter().copied().collect(),
                    scoreboard,
                });
            }
        }

        for race in finished {
            let scores: Vec<ScoreInfo> = race
                .scoreboard
                .into_iter()
                .map(|(character_uid, course_time, connected)| {
                    let mut score = ScoreInfo {
                        uid: character_uid,
                        course_time,
                        flags: if connected { score_flag::CONNECTED } else { 0 },
                        ..Default::default()
                    };
                    if let Some(record) = self.ctx.data.character(character_uid) {
                        record.immutable(|character| {
                            score.name = character.name.clone();
                            score.level = character.level;
                            if let Some(mount) = self.ctx.data.horse(character.mount_uid) {
                                score.mount_name = mount.immutable(|horse| horse.name.clone());
                            }
                        });
                    }
                    score
                })
                .collect();

            for client in race.clients {
                let scores = scores.clone();
                self.server
                    .queue_command(client, move || AcCmdRCRaceResultNotify { scores });
            }

            let _ = self
                .ctx
                .rooms
                .get_room(race.room_uid, |room| room.set_playing(false));
            info!(room = race.room_uid, "race finished");
        }
    }

    fn context(&self, client_id: ClientId) -> anyhow::Result<ClientContext> {
        let state = self.state.lock().unwrap();
        let context = state
            .clients
            .get(&client_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("race client {client_id} is not available"))?;
        if !context.is_authenticated {
            anyhow::bail!("race client {client_id} is not authenticated");
        }
        Ok(context)
    }

    /// Runs `f` with the client's race instance and their racer entry after
    /// the oid identity check. A mismatched oid is a protocol-fatal error.
    fn with_own_racer<R>(
        &self,
        client_id: ClientId,
        claimed_oid: Oid,
        f: impl FnOnce(&mut RaceInstance, Uid) -> R,
    ) -> anyhow::Result<R> {
        let context = self.context(client_id)?;
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get_mut(&context.room_uid)
            .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
        let racer = instance
            .tracker
            .racer(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
        if claimed_oid != racer.oid {
            anyhow::bail!("client acted on behalf of another racer");
        }
        Ok(f(instance, context.character_uid))
    }

    fn broadcast_to_instance<T: canterproto::ServerCommand + Clone>(
        &self,
        clients: &HashSet<ClientId>,
        command: T,
        except: Option<ClientId>,
    ) {
        for client in clients {
            if Some(*client) == except {
                continue;
            }
            let command = command.clone();
            self.server.queue_command(*client, move || command);
        }
    }

    fn handle_enter_room(
        &self,
        client_id: ClientId,
        command: AcCmdCREnterRoom,
    ) -> anyhow::Result<()> {
        let authorized = self.ctx.otp.authorize_code(
            otp::identity_hash(&[command.character_uid, command.room_uid]),
            command.one_time_password,
        );

        let room_exists = self.ctx.rooms.room_exists(command.room_uid);

        // Commit the queued seat; a full room refuses here.
        let mut overcrowded = false;
        if authorized && room_exists {
            let _ = self.ctx.rooms.get_room(command.room_uid, |room| {
                overcrowded = !room.add_player(command.character_uid);
            });
        }

        if !authorized || !room_exists || overcrowded {
            debug!(
                client = client_id,
                room = command.room_uid,
                authorized,
                room_exists,
                overcrowded,
                "enter room refused"
            );
            self.server
                .queue_command(client_id, || AcCmdCREnterRoomCancel);
            return Ok(());
        }

        let (is_new_instance, is_waiting, existing_clients) = {
            let mut state = self.state.lock().unwrap();
            let context = state
                .clients
                .get_mut(&client_id)
                .ok_or_else(|| anyhow::anyhow!("race client {client_id} is not available"))?;
            context.is_authenticated = true;
            context.character_uid = command.character_uid;
            context.room_uid = command.room_uid;

            let is_new = !state.instances.contains_key(&command.room_uid);
            let instance = state
                .instances
                .entry(command.room_uid)
                .or_insert_with(|| RaceInstance::new(command.character_uid));
            (
                is_new,
                instance.stage == Stage::Waiting,
                instance.clients.iter().copied().collect::<Vec<_>>(),
            )
        };

        if is_new_instance {
            info!(
                character = command.character_uid,
                room = command.room_uid,
                "room instance opened"
            );
        } else {
            info!(
                character = command.character_uid,
                room = command.room_uid,
                "character joined room"
            );
        }

        // Snapshot the room for the joiner.
        let (description, player_uids) = self.ctx.rooms.get_room(command.room_uid, |room| {
            let details = room.details();
            let description = RoomDescription {
                name: details.name.clone(),
                password: details.password.clone(),
                max_player_count: details.max_player_count as u8,
                game_mode: mode_id(details.game_mode),
                team_mode: match details.team_mode {
                    rooms::TeamMode::Solo => ProtoTeamMode::Ffa as u8,
                    rooms::TeamMode::Team => ProtoTeamMode::Team as u8,
                },
                map_block_id: details.course_id,
                mission_id: details.mission_id,
                npc_race: details.npc_race,
                skill_bracket: details.skill_bracket,
            };
            let players: Vec<(Uid, bool, rooms::PlayerTeam)> = room
                .players()
                .iter()
                .map(|(uid, player)| (*uid, player.is_ready(), player.team()))
                .collect();
            (description, players)
        })?;

        let master_uid = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&command.room_uid)
                .map(|i| i.master_uid)
                .unwrap_or(INVALID_UID)
        };

        let mut joining_racer = ProtoRacer::default();
        let mut racers = Vec::new();
        for (character_uid, is_ready, team) in player_uids {
            let Some(record) = self.ctx.data.character(character_uid) else {
                warn!(character = character_uid, "room player record unavailable");
                continue;
            };
            let racer = record.immutable(|character| ProtoRacer {
                uid: character.uid,
                name: character.name.clone(),
                level: character.level,
                is_master: character.uid == master_uid,
                is_hidden: false,
                is_npc: false,
                is_ready,
                team_color: team_color(room_team(team)),
                avatar: Some(protohelp::build_avatar(&self.ctx.data, character)),
                guild: if character.guild_uid != INVALID_UID {
                    self.ctx.data.guild(character.guild_uid).map(|record| {
                        record.immutable(|guild| protohelp::build_guild(guild, character.uid))
                    })
                } else {
                    None
                },
            });
            if character_uid == command.character_uid {
                joining_racer = racer.clone();
            }
            racers.push(racer);
        }

        let response = AcCmdCREnterRoomOK {
            room_uid: command.room_uid,
            is_room_waiting: is_waiting,
            description,
            racers,
        };
        self.server.queue_command(client_id, move || response);

        let notify = AcCmdCREnterRoomNotify {
            racer: joining_racer,
            average_time_record: 0,
        };
        for other in existing_clients {
            let notify = notify.clone();
            self.server.queue_command(other, move || notify);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(&command.room_uid) {
            instance.clients.insert(client_id);
        }
        Ok(())
    }

    fn handle_change_room_options(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeRoomOptions,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        self.ctx.rooms.get_room(context.room_uid, |room| {
            let details = room.details_mut();
            if command.options_bitfield & room_option::NAME != 0 {
                details.name = command.name.clone();
            }
            if command.options_bitfield & room_option::PLAYER_COUNT != 0 {
                details.max_player_count = u32::from(command.player_count.min(8));
            }
            if command.options_bitfield & room_option::PASSWORD != 0 {
                details.password = command.password.clone();
            }
            if command.options_bitfield & room_option::GAME_MODE != 0 {
                details.game_mode = match command.game_mode {
                    ProtoGameMode::Speed => rooms::GameMode::Speed,
                    ProtoGameMode::Magic => rooms::GameMode::Magic,
                    ProtoGameMode::Guild => rooms::GameMode::Guild,
                    ProtoGameMode::Tutorial => rooms::GameMode::Tutorial,
                };
            }
            if command.options_bitfield & room_option::MAP_BLOCK_ID != 0 {
                details.course_id = command.map_block_id;
            }
            if command.options_bitfield & room_option::NPC_RACE != 0 {
                details.npc_race = command.npc_race;
            }
        })?;

        let notify = AcCmdCRChangeRoomOptionsNotify {
            options_bitfield: command.options_bitfield,
            name: command.name,
            player_count: command.player_count,
            password: command.password,
            game_mode: command.game_mode,
            map_block_id: command.map_block_id,
            npc_race: command.npc_race,
        };

        let clients: Vec<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.iter().copied().collect())
                .unwrap_or_default()
        };
        for client in clients {
            let notify = notify.clone();
            self.server.queue_command(client, move || notify);
        }
        Ok(())
    }

    fn handle_change_team(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeTeam,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        self.ctx.rooms.get_room(context.room_uid, |room| {
            if let Some(player) = room.player_mut(context.character_uid) {
                player.set_team(match command.team_color {
                    TeamColor::Red => rooms::PlayerTeam::Red,
                    TeamColor::Blue => rooms::PlayerTeam::Blue,
                    TeamColor::None => rooms::PlayerTeam::Solo,
                });
            }
        })?;

        self.server.queue_command(client_id, move || AcCmdCRChangeTeamOK {
            character_oid: command.character_oid,
            team_color: command.team_color,
        });

        let others: Vec<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.iter().copied().filter(|c| *c != client_id).collect())
                .unwrap_or_default()
        };
        for other in others {
            self.server.queue_command(other, move || AcCmdCRChangeTeamNotify {
                character_oid: command.character_oid,
                team_color: command.team_color,
            });
        }
        Ok(())
    }

    fn handle_leave_room_command(
        &self,
        client_id: ClientId,
        _command: AcCmdCRLeaveRoom,
    ) -> anyhow::Result<()> {
        self.leave_room(client_id, true);
        Ok(())
    }

    /// Shared leave path for the explicit command and disconnects.
    fn leave_room(&self, client_id: ClientId, send_ok: bool) {
        let context = {
            let state = self.state.lock().unwrap();
            state.clients.get(&client_id).copied()
        };
        let Some(context) = context else {
            return;
        };
        if !context.is_authenticated || context.room_uid == INVALID_UID {
            return;
        }

        let (remaining, was_master, room_empty) = {
            let mut state = self.state.lock().unwrap();
            let Some(instance) = state.instances.get_mut(&context.room_uid) else {
                return;
            };

            if let Some(racer) = instance.tracker.racer_mut(context.character_uid) {
                racer.state = RacerState::Disconnected;
            }
            instance.clients.remove(&client_id);

            let was_master = instance.master_uid == context.character_uid;
            let remaining: Vec<ClientId> = instance.clients.iter().copied().collect();
            let room_empty = instance.clients.is_empty();

            if let Some(client) = state.clients.get_mut(&client_id) {
                client.room_uid = INVALID_UID;
            }
            (remaining, was_master, room_empty)
        };

        let _ = self.ctx.rooms.get_room(context.room_uid, |room| {
            room.remove_player(context.character_uid);
        });

        info!(
            character = context.character_uid,
            room = context.room_uid,
            "character left room"
        );

        let character_uid = context.character_uid;
        for other in &remaining {
            self.server
                .queue_command(*other, move || AcCmdCRLeaveRoomNotify { character_uid });
        }

        if room_empty {
            let _ = self.ctx.rooms.delete_room(context.room_uid);
            let mut state = self.state.lock().unwrap();
            state.instances.remove(&context.room_uid);
            info!(room = context.room_uid, "room closed");
        } else if was_master {
            // Promote the first remaining player.
            let next_master = self
                .ctx
                .rooms
                .get_room(context.room_uid, |room| {
                    room.players().keys().next().copied().unwrap_or(INVALID_UID)
                })
                .unwrap_or(INVALID_UID);

            if next_master != INVALID_UID {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(instance) = state.instances.get_mut(&context.room_uid) {
                        instance.master_uid = next_master;
                    }
                }
                info!(
                    character = next_master,
                    room = context.room_uid,
                    "mastership promoted"
                );
                for other in &remaining {
                    self.server.queue_command(*other, move || AcCmdCRChangeMasterNotify {
                        master_uid: next_master,
                    });
                }
            }
        }

        if send_ok {
            self.server.queue_command(client_id, || AcCmdCRLeaveRoomOK);
        }
    }

    fn handle_ready_race(
        &self,
        client_id: ClientId,
        _command: AcCmdCRReadyRace,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let is_ready = self.ctx.rooms.get_room(context.room_uid, |room| {
            room.player_mut(context.character_uid)
                .map(|player| player.toggle_ready())
                .unwrap_or(false)
        })?;

        let clients: Vec<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.iter().copied().collect())
                .unwrap_or_default()
        };
        let character_uid = context.character_uid;
        for client in clients {
            self.server.queue_command(client, move || AcCmdCRReadyRaceNotify {
                character_uid,
                is_ready,
            });
        }
        Ok(())
    }

    fn handle_start_race(
        &self,
        client_id: ClientId,
        _command: AcCmdCRStartRace,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        {
            let state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            if instance.master_uid != context.character_uid {
                anyhow::bail!("non-master client tried to start the race");
            }
        }

        // Snapshot the room configuration into the instance.
        let (game_mode, team_mode, mission_id, selected_course, players) =
            self.ctx.rooms.get_room(context.room_uid, |room| {
                let details = room.details();
                let players: Vec<(Uid, rooms::PlayerTeam)> = room
                    .players()
                    .iter()
                    .map(|(uid, player)| (*uid, player.team()))
                    .collect();
                (
                    details.game_mode,
                    details.team_mode,
                    details.mission_id,
                    details.course_id,
                    players,
                )
            })?;

        let map_block_id = if crate::registry::is_pseudo_course(selected_course) {
            self.pick_pool_map(game_mode, context.character_uid)
        } else {
            selected_course
        };

        let clients: Vec<ClientId> = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;

            instance.game_mode = game_mode;
            instance.team_mode = team_mode;
            instance.mission_id = mission_id;
            instance.map_block_id = map_block_id;

            instance.tracker.clear();
            instance.clients.iter().copied().collect::<Vec<_>>()
        };

        // Broadcast the room countdown before the racers are seeded.
        for client in &clients {
            self.server.queue_command(*client, move || AcCmdRCRoomCountdown {
                countdown_ms: ROOM_COUNTDOWN_MS,
                map_block_id,
            });
        }

        {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;

            self.prepare_item_spawners(instance);

            for (character_uid, team) in players {
                let racer = instance.tracker.add_racer(character_uid);
                racer.state = RacerState::Loading;
                racer.team = room_team(team);
            }

            instance.stage = Stage::Loading;
            instance.stage_timeout_at = Instant::now() + LOADING_TIMEOUT;
        }

        let _ = self
            .ctx
            .rooms
            .get_room(context.room_uid, |room| room.set_playing(true));

        info!(
            room = context.room_uid,
            map = map_block_id,
            "race starting"
        );

        // The start notification fires when the countdown runs out.
        let this = self.arc();
        let room_uid = context.room_uid;
        let mut state = self.state.lock().unwrap();
        state.scheduler.queue_at(
            Instant::now() + Duration::from_millis(u64::from(ROOM_COUNTDOWN_MS)),
            move || this.send_start_race_notify(room_uid),
        );
        Ok(())
    }

    fn pick_pool_map(&self, game_mode: rooms::GameMode, master_uid: Uid) -> u16 {
        let fallback = self.ctx.config.fallback_map_block_id;
        let Ok(mode_info) = self.ctx.registry.game_mode_info(mode_id(game_mode)) else {
            return fallback;
        };
        if mode_info.map_pool.is_empty() {
            return fallback;
        }

        let master_level = self
            .ctx
            .data
            .character(master_uid)
            .map(|record| record.immutable(|character| character.level))
            .unwrap_or(0);

        // Gate the pool on the master's level.
        let eligible: Vec<u16> = mode_info
            .map_pool
            .iter()
            .copied()
            .filter(|map_block_id| {
                self.ctx
                    .registry
                    .map_block_info(*map_block_id)
                    .map(|block| block.required_level <= master_level)
                    .unwrap_or(false)
            })
            .collect();

        if eligible.is_empty() {
            return fallback;
        }
        eligible[rand::thread_rng().gen_range(0..eligible.len())]
    }

    /// Seeds the tracker with course pickups: every deck the mode allows,
    /// at every templated position, offset by the map block's origin.
    fn prepare_item_spawners(&self, instance: &mut RaceInstance) {
        let mode_info = match self.ctx.registry.game_mode_info(mode_id(instance.game_mode)) {
            Ok(info) => info,
            Err(e) => {
                warn!(err = %e, "cannot prepare item spawners");
                return;
            }
        };
        let block = match self.ctx.registry.map_block_info(instance.map_block_id) {
            Ok(block) => block,
            Err(e) => {
                warn!(err = %e, "cannot prepare item spawners");
                return;
            }
        };

        for deck_id in &mode_info.used_deck_item_ids {
            for spawn in &block.deck_items {
                if spawn.deck_id != *deck_id {
                    continue;
                }
                instance.tracker.add_item(
                    spawn.deck_id,
                    [
                        spawn.position[0] + block.offset[0],
                        spawn.position[1] + block.offset[1],
                        spawn.position[2] + block.offset[2],
                    ],
                );
            }
        }
    }

    fn send_start_race_notify(&self, room_uid: Uid) {
        struct Recipient {
            client_id: ClientId,
            character_uid: Uid,
            host_oid: Oid,
        }

        let (base, recipients, eligible_for_skills, game_mode) = {
            let state = self.state.lock().unwrap();
            let Some(instance) = state.instances.get(&room_uid) else {
                // The room died between scheduling and firing.
                return;
            };

            let mut racers = Vec::new();
            for (character_uid, racer) in instance.tracker.racers() {
                let name = self
                    .ctx
                    .data
                    .character(*character_uid)
                    .map(|record| record.immutable(|c| c.name.clone()))
                    .unwrap_or_default();
                racers.push(StartRacePlayer {
                    oid: racer.oid,
                    name,
                    p2p_id: racer.oid,
                    team_color: team_color(racer.team),
                });
            }

            let relay = self.ctx.config.relay;
            let base = AcCmdCRStartRaceNotify {
                game_mode: mode_id(instance.game_mode),
                team_mode: match instance.team_mode {
                    rooms::TeamMode::Solo => ProtoTeamMode::Ffa as u8,
                    rooms::TeamMode::Team => ProtoTeamMode::Team as u8,
                },
                map_block_id: instance.map_block_id,
                mission_id: instance.mission_id,
                host_oid: INVALID_OID,
                p2p_relay_address: u32::from(relay.address),
                p2p_relay_port: relay.port,
                racers,
                active_skill_set: None,
            };

            let eligible_for_skills = matches!(
                instance.game_mode,
                rooms::GameMode::Speed | rooms::GameMode::Magic
            ) && instance.team_mode == rooms::TeamMode::Solo;

            let recipients: Vec<Recipient> = instance
                .clients
                .iter()
                .filter_map(|client_id| {
                    let context = state.clients.get(client_id)?;
                    let racer = instance.tracker.racer(context.character_uid)?;
                    Some(Recipient {
                        client_id: *client_id,
                        character_uid: context.character_uid,
                        host_oid: racer.oid,
                    })
                })
                .collect();

            (base, recipients, eligible_for_skills, instance.game_mode)
        };

        let bonus_skills = if eligible_for_skills {
            self.ctx
                .registry
                .game_mode_info(mode_id(game_mode))
                .map(|info| info.bonus_skills.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        for recipient in recipients {
            let mut notify = base.clone();
            notify.host_oid = recipient.host_oid;

            if eligible_for_skills {
                if let Some(record) = self.ctx.data.character(recipient.character_uid) {
                    let (set_id, active) = record.immutable(|character| {
                        let sets = match game_mode {
                            rooms::GameMode::Magic => &character.skills.magic,
                            _ => &character.skills.speed,
                        };
                        (sets.active_set_id, sets.active())
                    });

                    let bonus = if bonus_skills.is_empty() {
                        0
                    } else {
                        bonus_skills[rand::thread_rng().gen_range(0..bonus_skills.len())]
                    };
                    notify.active_skill_set = Some(ActiveSkillSet {
                        set_id,
                        skills: [active.slot1, active.slot2, bonus],
                    });
                }
            }

            self.server
                .queue_command(recipient.client_id, move || notify);
        }
    }

    fn handle_race_timer(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceTimer,
    ) -> anyhow::Result<()> {
        self.server.queue_command(client_id, move || AcCmdUserRaceTimerOK {
            client_clock: command.client_clock,
            server_clock: race_timestamp(Instant::now()),
        });
        Ok(())
    }

    fn handle_loading_complete(
        &self,
        client_id: ClientId,
        _command: AcCmdCRLoadingComplete,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let (oid, clients) = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer_mut(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            racer.state = RacerState::Racing;
            (
                racer.oid,
                instance.clients.iter().copied().collect::<Vec<_>>(),
            )
        };

        for client in clients {
            self.server
                .queue_command(client, move || AcCmdCRLoadingCompleteNotify { oid });
        }
        Ok(())
    }

    fn handle_user_race_final(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceFinal,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let (oid, clients) = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer_mut(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            racer.state = RacerState::Finishing;
            racer.course_time = command.course_time;
            (
                racer.oid,
                instance.clients.iter().copied().collect::<Vec<_>>(),
            )
        };

        let course_time = command.course_time;
        for client in clients {
            self.server.queue_command(client, move || AcCmdUserRaceFinalNotify {
                oid,
                course_time,
            });
        }
        Ok(())
    }

    fn handle_race_result(
        &self,
        client_id: ClientId,
        _command: AcCmdCRRaceResult,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let carrots = self
            .ctx
            .data
            .character(context.character_uid)
            .map(|record| record.immutable(|character| character.carrots))
            .unwrap_or(0);

        self.server.queue_command(client_id, move || AcCmdCRRaceResultOK {
            current_carrots: carrots,
        });
        Ok(())
    }

    fn handle_p2p_result(
        &self,
        client_id: ClientId,
        _command: AcCmdCRP2PResult,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let oids: Vec<Oid> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|instance| instance.tracker.racers().values().map(|r| r.oid).collect())
                .unwrap_or_default()
        };
        self.server
            .queue_command(client_id, move || AcCmdGameRaceP2PResult { oids });
        Ok(())
    }

    fn handle_user_p2p_result(
        &self,
        _client_id: ClientId,
        _command: AcCmdUserRaceP2PResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_award_start(
        &self,
        client_id: ClientId,
        command: AcCmdCRAwardStart,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        // The award plays for spectators: clients without a live racer.
        let spectators: Vec<ClientId> = {
            let state = self.state.lock().unwrap();
            let Some(instance) = state.instances.get(&context.room_uid) else {
                return Ok(());
            };
            instance
                .clients
                .iter()
                .copied()
                .filter(|client| {
                    let Some(other) = state.clients.get(client) else {
                        return true;
                    };
                    match instance.tracker.racer(other.character_uid) {
                        Some(racer) => racer.state == RacerState::Disconnected,
                        None => true,
                    }
                })
                .collect()
        };

        let award_id = command.award_id;
        for spectator in spectators {
            self.server
                .queue_command(spectator, move || AcCmdRCAwardNotify { award_id });
        }
        Ok(())
    }

    fn handle_award_end(
        &self,
        client_id: ClientId,
        _command: AcCmdCRAwardEnd,
    ) -> anyhow::Result<()> {
        // End-of-award has no defined broadcast shape; acknowledge by doing
        // nothing.
        debug!(client = client_id, "award end received");
        Ok(())
    }

    fn handle_star_point_get(
        &self,
        client_id: ClientId,
        command: AcCmdCRStarPointGet,
    ) -> anyhow::Result<()> {
        let registry = &self.ctx.registry;
        let response = self.with_own_racer(client_id, command.character_oid, |instance, uid| {
            let mode_info = registry.game_mode_info(mode_id(instance.game_mode))?;
            let racer = instance.tracker.racer_mut(uid).expect("checked racer");
            racer.star_point_value = racer
                .star_point_value
                .saturating_add(command.gained_star_points)
                .min(mode_info.star_points_max);

            // Boost pickups never hand out magic items.
            anyhow::Ok(AcCmdCRStarPointGetOK {
                character_oid: command.character_oid,
                star_point_value: racer.star_point_value,
                give_magic_item: false,
            })
        })??;

        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_request_spur(
        &self,
        client_id: ClientId,
        command: AcCmdCRRequestSpur,
    ) -> anyhow::Result<()> {
        let registry = &self.ctx.registry;
        let (response, gauge) =
            self.with_own_racer(client_id, command.character_oid, |instance, uid| {
                let mode_info = registry.game_mode_info(mode_id(instance.game_mode))?;
                let racer = instance.tracker.racer_mut(uid).expect("checked racer");

                if racer.star_point_value < mode_info.spur_consume_star_points {
                    anyhow::bail!("spur requested without the gauge to pay for it");
                }
                racer.star_point_value -= mode_info.spur_consume_star_points;

                anyhow::Ok((
                    AcCmdCRRequestSpurOK {
                        character_oid: command.character_oid,
                        active_boosters: command.active_boosters,
                        star_point_value: racer.star_point_value,
                        combo_break: command.combo_break,
                    },
                    racer.star_point_value,
                ))
            })??;

        self.server.queue_command(client_id, move || response);
        // The gauge echo keeps the client HUD in sync with the deduction.
        self.server.queue_command(client_id, move || AcCmdCRStarPointGetOK {
            character_oid: command.character_oid,
            star_point_value: gauge,
            give_magic_item: false,
        });
        Ok(())
    }

    fn handle_hurdle_clear_result(
        &self,
        client_id: ClientId,
        command: AcCmdCRHurdleClearResult,
    ) -> anyhow::Result<()> {
        use canterproto::common::HurdleClearType;

        let registry = &self.ctx.registry;
        let (response, star_point_response) =
            self.with_own_racer(client_id, command.character_oid, |instance, uid| {
                let mode_info = registry.game_mode_info(mode_id(instance.game_mode))?;
                let is_magic = instance.game_mode == rooms::GameMode::Magic;
                let racer = instance.tracker.racer_mut(uid).expect("checked racer");

                let mut response = AcCmdCRHurdleClearResultOK {
                    character_oid: command.character_oid,
                    hurdle_clear_type: command.hurdle_clear_type,
                    jump_combo: 0,
                };

                match command.hurdle_clear_type {
                    HurdleClearType::Perfect => {
                        racer.jump_combo_value = (racer.jump_combo_value + 1).min(99);
                        if !is_magic {
                            response.jump_combo = racer.jump_combo_value;
                        }

                        let combo_bonus = mode_info
                            .perfect_jump_max_bonus_combo
                            .min(racer.jump_combo_value)
                            * mode_info.perfect_jump_unit_star_points;
                        racer.star_point_value = racer
                            .star_point_value
                            .saturating_add(mode_info.perfect_jump_star_points + combo_bonus)
                            .min(mode_info.star_points_max);
                    }
                    HurdleClearType::Good | HurdleClearType::DoubleJumpOrGlide => {
                        racer.jump_combo_value = 0;
                        racer.star_point_value = racer
                            .star_point_value
                            .saturating_add(mode_info.good_jump_star_points)
                            .min(mode_info.star_points_max);
                    }
                    HurdleClearType::Collision => {
                        racer.jump_combo_value = 0;
                    }
                }

                // In magic races a gauge-saturating perfect asks the client
                // to request its item.
                let give_magic_item = is_magic
                    && racer.star_point_value >= mode_info.star_points_max
                    && command.hurdle_clear_type == HurdleClearType::Perfect;

                let star_point_response =
                    if command.hurdle_clear_type == HurdleClearType::Collision {
                        None
                    } else {
                        Some(AcCmdCRStarPointGetOK {
                            character_oid: command.character_oid,
                            star_point_value: racer.star_point_value,
                            give_magic_item,
                        })
                    };

                anyhow::Ok((response, star_point_response))
            })??;

        if let Some(star_point_response) = star_point_response {
            self.server
                .queue_command(client_id, move || star_point_response);
        }
        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_starting_rate(
        &self,
        client_id: ClientId,
        command: AcCmdCRStartingRate,
    ) -> anyhow::Result<()> {
        if command.velocity < 1 && command.boost_gained < 1 {
            return Ok(());
        }

        let registry = &self.ctx.registry;
        let response = self.with_own_racer(client_id, command.character_oid, |instance, uid| {
            let mode_info = registry.game_mode_info(mode_id(instance.game_mode))?;
            let racer = instance.tracker.racer_mut(uid).expect("checked racer");

            let gained = command.boost_gained.min(mode_info.starting_rate_max);
            racer.star_point_value = racer
                .star_point_value
                .saturating_add(gained)
                .min(mode_info.star_points_max);

            anyhow::Ok(AcCmdCRStarPointGetOK {
                character_oid: command.character_oid,
                star_point_value: racer.star_point_value,
                give_magic_item: false,
            })
        })??;

        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_race_user_pos(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceUpdatePos,
    ) -> anyhow::Result<()> {
        let registry = &self.ctx.registry;
        let (spawns, gauge_update) =
            self.with_own_racer(client_id, command.oid, |instance, uid| {
                let now = Instant::now();
                let is_magic = instance.game_mode == rooms::GameMode::Magic;
                let race_started = now >= instance.race_start_at;
                let mode_info = registry.game_mode_info(mode_id(instance.game_mode))?;
                let star_points_max = mode_info.star_points_max;

                // Proximity item tracking: spawn for this racer inside the
                // threshold, forget once they ride away. Spawns are
                // idempotent per racer and item.
                let mut spawns: Vec<AcCmdGameRaceItemSpawn> = Vec::new();
                let items: Vec<(Oid, u32, [f32; 3], Instant)> = instance
                    .tracker
                    .items()
                    .values()
                    .map(|item| (item.oid, item.deck_id, item.position, item.respawn_at))
                    .collect();
                let racer = instance.tracker.racer_mut(uid).expect("checked racer");

                for (item_oid, deck_id, position, respawn_at) in items {
                    if now < respawn_at {
                        continue;
                    }

                    let dx = command.position[0] - position[0];
                    let dy = command.position[1] - position[1];
                    let dz = command.position[2] - position[2];
                    let distance = (dx * dx + dy * dy + dz * dz).sqrt();

                    let in_proximity = distance < ITEM_SPAWN_DISTANCE;
                    let tracked = racer.tracked_items.contains(&item_oid);

                    if tracked {
                        if !in_proximity {
                            racer.tracked_items.remove(&item_oid);
                        }
                        continue;
                    }
                    if !in_proximity {
                        continue;
                    }

                    racer.tracked_items.insert(item_oid);
                    spawns.push(AcCmdGameRaceItemSpawn {
                        item_oid,
                        deck_id,
                        position,
                        orientation: [0.0, 0.0, 0.0, 1.0],
                        size_level: false,
                        remove_delay: -1,
                    });
                }

                // Magic gauge trickle while racing empty-handed.
                let mut gauge_update = None;
                if is_magic
                    && racer.state == RacerState::Racing
                    && race_started
                    && racer.magic_item.is_none()
                {
                    if racer.star_point_value < star_points_max {
                        racer.star_point_value = racer
                            .star_point_value
                            .saturating_add(NO_ITEM_HELD_BOOST_AMOUNT)
                            .min(star_points_max);
                    }
                    gauge_update = Some(AcCmdCRStarPointGetOK {
                        character_oid: command.oid,
                        star_point_value: racer.star_point_value,
                        give_magic_item: racer.star_point_value >= star_points_max,
                    });
                }

                anyhow::Ok((spawns, gauge_update))
            })??;

        for spawn in spawns {
            self.server.queue_command(client_id, move || spawn);
        }
        if let Some(update) = gauge_update {
            self.server.queue_command(client_id, move || update);
        }
        Ok(())
    }

    fn handle_race_item_get(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceItemGet,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let respawn_delay = {
            let state = self.state.lock().unwrap();
            let deck_id = state
                .instances
                .get(&context.room_uid)
                .and_then(|i| i.tracker.item(command.item_oid))
                .map(|item| item.deck_id);
            deck_id
                .and_then(|deck| self.ctx.registry.item_deck(deck))
                .map(|deck| Duration::from_millis(deck.respawn_ms))
                .unwrap_or(Duration::from_millis(500))
        };

        enum Pickup {
            Gauge(AcCmdCRStarPointGetOK),
            Magic { item_id: u32, oid: Oid },
            AlreadyHolding,
            None,
        }

        let (deck_id, item_position, clients, pickup) = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let game_mode = instance.game_mode;

            let mode_info = self.ctx.registry.game_mode_info(mode_id(game_mode))?;
            let star_points_max = mode_info.star_points_max;

            let item = instance
                .tracker
                .item_mut(command.item_oid)
                .ok_or_else(|| anyhow::anyhow!("item {} is not tracked", command.item_oid))?;
            item.respawn_at = Instant::now() + respawn_delay;
            let deck_id = item.deck_id;
            let item_position = item.position;

            let racer = instance
                .tracker
                .racer_mut(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;

            let pickup = match game_mode {
                rooms::GameMode::Speed | rooms::GameMode::Guild | rooms::GameMode::Tutorial => {
                    match deck_id {
                        // Gold horseshoe: fill up to the next spur's worth.
                        101 => {
                            racer.star_point_value = (((racer.star_point_value / 40_000) + 1)
                                * 40_000)
                                .min(star_points_max);
                            Pickup::Gauge(AcCmdCRStarPointGetOK {
                                character_oid: command.character_oid,
                                star_point_value: racer.star_point_value,
                                give_magic_item: false,
                            })
                        }
                        // Silver horseshoe: a flat bonus.
                        102 => {
                            racer.star_point_value =
                                racer.star_point_value.saturating_add(10_000).min(star_points_max);
                            Pickup::Gauge(AcCmdCRStarPointGetOK {
                                character_oid: command.character_oid,
                                star_point_value: racer.star_point_value,
                                give_magic_item: false,
                            })
                        }
                        _ => {
                            warn!(deck = deck_id, "pickup with unknown deck id");
                            Pickup::None
                        }
                    }
                }
                rooms::GameMode::Magic => {
                    if racer.magic_item.is_some() {
                        Pickup::AlreadyHolding
                    } else {
                        let item_id = random_magic_item();
                        racer.magic_item = Some(item_id);
                        Pickup::Magic {
                            item_id,
                            oid: racer.oid,
                        }
                    }
                }
            };

            // The pickup disappears from every client until it respawns.
            for racer in instance.tracker.racers_mut().values_mut() {
                racer.tracked_items.remove(&command.item_oid);
            }

            (
                deck_id,
                item_position,
                instance.clients.iter().copied().collect::<Vec<_>>(),
                pickup,
            )
        };

        match pickup {
            Pickup::Gauge(response) => {
                self.server.queue_command(client_id, move || response);
            }
            Pickup::Magic { item_id, oid } => {
                self.server.queue_command(client_id, move || AcCmdCRRequestMagicItemOK {
                    character_oid: oid,
                    magic_item_id: item_id,
                });
                for client in &clients {
                    self.server.queue_command(*client, move || AcCmdCRRequestMagicItemNotify {
                        magic_item_id: item_id,
                        character_oid: oid,
                    });
                }
            }
            Pickup::AlreadyHolding => {
                warn!(
                    character = context.character_uid,
                    room = context.room_uid,
                    "magic pickup while already holding an item"
                );
                return Ok(());
            }
            Pickup::None => {}
        }

        let get = AcCmdGameRaceItemGet {
            character_oid: command.character_oid,
            item_oid: command.item_oid,
            deck_id,
        };
        for client in &clients {
            self.server.queue_command(*client, move || get);
        }

        // Everyone re-sees the item once its respawn lapses.
        let this = self.arc();
        let room_uid = context.room_uid;
        let item_oid = command.item_oid;
        let mut state = self.state.lock().unwrap();
        state
            .scheduler
            .queue_at(Instant::now() + respawn_delay, move || {
                let clients: Vec<ClientId> = {
                    let state = this.state.lock().unwrap();
                    match state.instances.get(&room_uid) {
                        Some(instance) => instance.clients.iter().copied().collect(),
                        // The room died between scheduling and firing.
                        None => return,
                    }
                };
                let spawn = AcCmdGameRaceItemSpawn {
                    item_oid,
                    deck_id,
                    position: item_position,
                    orientation: [0.0, 0.0, 0.0, 1.0],
                    size_level: false,
                    remove_delay: -1,
                };
                for client in clients {
                    this.server.queue_command(client, move || spawn);
                }
            });
        Ok(())
    }

    fn handle_request_magic_item(
        &self,
        client_id: ClientId,
        command: AcCmdCRRequestMagicItem,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        enum Grant {
            Granted { item_id: u32, oid: Oid },
            AlreadyHolding,
        }

        let (grant, clients) = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer_mut(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            if command.character_oid != racer.oid {
                anyhow::bail!("client acted on behalf of another racer");
            }

            let grant = if racer.magic_item.is_some() {
                Grant::AlreadyHolding
            } else {
                let item_id = random_magic_item();
                racer.magic_item = Some(item_id);
                racer.star_point_value = 0;
                Grant::Granted {
                    item_id,
                    oid: racer.oid,
                }
            };
            (
                grant,
                instance.clients.iter().copied().collect::<Vec<_>>(),
            )
        };

        match grant {
            Grant::AlreadyHolding => {
                warn!(
                    character = context.character_uid,
                    room = context.room_uid,
                    "magic item requested while already holding one"
                );
                Ok(())
            }
            Grant::Granted { item_id, oid } => {
                // The grant zeroes the gauge.
                self.server.queue_command(client_id, move || AcCmdCRStarPointGetOK {
                    character_oid: oid,
                    star_point_value: 0,
                    give_magic_item: false,
                });
                self.server.queue_command(client_id, move || AcCmdCRRequestMagicItemOK {
                    character_oid: oid,
                    magic_item_id: item_id,
                });
                for client in clients {
                    if client == client_id {
                        continue;
                    }
                    self.server.queue_command(client, move || AcCmdCRRequestMagicItemNotify {
                        magic_item_id: item_id,
                        character_oid: oid,
                    });
                }
                Ok(())
            }
        }
    }

    fn handle_use_magic_item(
        &self,
        client_id: ClientId,
        command: AcCmdCRUseMagicItem,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        info!(
            character = context.character_uid,
            magic_item = command.magic_item_id,
            "magic item used"
        );

        struct BoltHit {
            target_oid: Oid,
        }

        let (clients, bolt_hit, ice_wall) = {
            let mut state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get_mut(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            if command.character_oid != racer.oid {
                anyhow::bail!("client acted on behalf of another racer");
            }
            let attacker_oid = racer.oid;

            // Bolt auto-targets the first other racer still racing, and the
            // hit knocks their held item away.
            let mut bolt_hit = None;
            if command.magic_item_id == MAGIC_ITEM_BOLT {
                let target_oid = instance
                    .tracker
                    .racers()
                    .values()
                    .find(|other| {
                        other.oid != attacker_oid && other.state == RacerState::Racing
                    })
                    .map(|other| other.oid);

                if let Some(target_oid) = target_oid {
                    if let Some((_, target)) = instance.tracker.racer_by_oid_mut(target_oid) {
                        target.magic_item = None;
                    }
                    bolt_hit = Some(BoltHit { target_oid });
                }
            }

            // Ice wall materializes as a course item.
            let mut ice_wall = None;
            if command.magic_item_id == MAGIC_ITEM_ICE_WALL {
                let item = instance.tracker.add_item(ICE_WALL_DECK_ID, ICE_WALL_POSITION);
                ice_wall = Some(AcCmdGameRaceItemSpawn {
                    item_oid: item.oid,
                    deck_id: item.deck_id,
                    position: item.position,
                    orientation: [0.0, 0.0, 0.0, 1.0],
                    size_level: false,
                    remove_delay: -1,
                });
            }

            let racer = instance
                .tracker
                .racer_mut(context.character_uid)
                .expect("checked racer");
            racer.magic_item = None;

            (
                instance.clients.iter().copied().collect::<HashSet<_>>(),
                bolt_hit,
                ice_wall,
            )
        };

        let response = AcCmdCRUseMagicItemOK {
            character_oid: command.character_oid,
            magic_item_id: command.magic_item_id,
            target_oids: command.target_oids.clone(),
            cast_time: command.cast_time,
            effect_duration: command.effect_duration,
        };
        self.server.queue_command(client_id, move || response);

        // The generic usage notify covers everything but the ice wall,
        // which replaces it with an item spawn.
        if command.magic_item_id != MAGIC_ITEM_ICE_WALL {
            let mut notify = AcCmdCRUseMagicItemNotify {
                character_oid: command.character_oid,
                magic_item_id: command.magic_item_id,
                target_oids: command.target_oids,
                cast_time: command.cast_time,
                effect_duration: command.effect_duration,
            };
            if command.magic_item_id == MAGIC_ITEM_BOLT {
                notify.cast_time = Some(notify.cast_time.unwrap_or(0.0));
                notify.effect_duration = Some(notify.effect_duration.unwrap_or(0.0));
            }
            self.broadcast_to_instance(&clients, notify, Some(client_id));
        }

        if let Some(hit) = bolt_hit {
            let hit_notify = AcCmdCRUseMagicItemNotify {
                character_oid: hit.target_oid,
                magic_item_id: MAGIC_ITEM_BOLT,
                target_oids: Vec::new(),
                // Bolt flight and knockdown timings.
                cast_time: Some(1.0),
                effect_duration: Some(3.0),
            };
            self.broadcast_to_instance(&clients, hit_notify, None);
        }

        if let Some(spawn) = ice_wall {
            self.broadcast_to_instance(&clients, spawn, None);
        }
        Ok(())
    }

    fn handle_start_magic_target(
        &self,
        client_id: ClientId,
        command: AcCmdCRStartMagicTarget,
    ) -> anyhow::Result<()> {
        self.with_own_racer(client_id, command.character_oid, |instance, uid| {
            let racer = instance.tracker.racer_mut(uid).expect("checked racer");
            racer.is_targeting = true;
            racer.current_target = INVALID_OID;
        })
    }

    fn client_by_oid(&self, room_uid: Uid, oid: Oid) -> Option<ClientId> {
        let state = self.state.lock().unwrap();
        let instance = state.instances.get(&room_uid)?;
        instance
            .clients
            .iter()
            .find(|client| {
                state
                    .clients
                    .get(client)
                    .and_then(|context| instance.tracker.racer(context.character_uid))
                    .map(|racer| racer.oid == oid)
                    .unwrap_or(false)
            })
            .copied()
    }

    fn handle_change_magic_target_notify(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeMagicTargetNotify,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        self.with_own_racer(client_id, command.character_oid, |instance, uid| {
            let racer = instance.tracker.racer_mut(uid).expect("checked racer");
            racer.current_target = command.target_oid;
        })?;

        // The target learns they are in someone's reticle.
        if let Some(target_client) = self.client_by_oid(context.room_uid, command.target_oid) {
            self.server.queue_command(target_client, move || command);
        }
        Ok(())
    }

    fn handle_change_magic_target_ok(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeMagicTargetOK,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let clients = self.with_own_racer(client_id, command.character_oid, |instance, uid| {
            // The confirmed target loses their held item to the bolt.
            if let Some((_, target)) = instance.tracker.racer_by_oid_mut(command.target_oid) {
                target.magic_item = None;
            }

            let racer = instance.tracker.racer_mut(uid).expect("checked racer");
            racer.is_targeting = false;
            racer.current_target = INVALID_OID;
            racer.magic_item = None;

            instance.clients.iter().copied().collect::<HashSet<_>>()
        })?;

        info!(
            attacker = command.character_oid,
            target = command.target_oid,
            room = context.room_uid,
            "bolt fired"
        );

        let hit_notify = AcCmdCRUseMagicItemNotify {
            character_oid: command.target_oid,
            magic_item_id: MAGIC_ITEM_BOLT,
            target_oids: Vec::new(),
            cast_time: Some(1.0),
            effect_duration: Some(3.0),
        };
        self.broadcast_to_instance(&clients, hit_notify, None);
        Ok(())
    }

    fn handle_change_magic_target_cancel(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeMagicTargetCancel,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let previous_target =
            self.with_own_racer(client_id, command.character_oid, |instance, uid| {
                let racer = instance.tracker.racer_mut(uid).expect("checked racer");
                let previous = racer.current_target;
                racer.is_targeting = false;
                racer.current_target = INVALID_OID;
                previous
            })?;

        if previous_target != INVALID_OID {
            if let Some(target_client) = self.client_by_oid(context.room_uid, previous_target) {
                let character_oid = command.character_oid;
                self.server.queue_command(target_client, move || AcCmdRCRemoveMagicTarget {
                    character_oid,
                });
            }
        }
        Ok(())
    }

    fn handle_chat(&self, client_id: ClientId, command: AcCmdCRChat) -> anyhow::Result<()> {
        let context = self.context(client_id)?;

        let author = self
            .ctx
            .data
            .character(context.character_uid)
            .map(|record| record.immutable(|character| character.name.clone()))
            .unwrap_or_default();

        let verdict = self
            .ctx
            .chat
            .process_message(&self.ctx.infractions, &author, &command.message);
        if verdict.suppress {
            return Ok(());
        }

        info!(room = context.room_uid, author = %author, "chat");

        let clients: Vec<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.iter().copied().collect())
                .unwrap_or_default()
        };
        for client in clients {
            let author = author.clone();
            let message = verdict.message.clone();
            self.server.queue_command(client, move || AcCmdCRChatNotify {
                author,
                message,
                is_system: false,
            });
        }
        Ok(())
    }

    fn handle_relay_command(
        &self,
        client_id: ClientId,
        command: AcCmdCRRelayCommand,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let clients: HashSet<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.clone())
                .unwrap_or_default()
        };
        self.broadcast_to_instance(
            &clients,
            AcCmdCRRelayCommandNotify {
                kind: command.kind,
                value: command.value,
            },
            Some(client_id),
        );
        Ok(())
    }

    fn handle_relay(&self, client_id: ClientId, command: AcCmdCRRelay) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let clients: HashSet<ClientId> = {
            let state = self.state.lock().unwrap();
            state
                .instances
                .get(&context.room_uid)
                .map(|i| i.clients.clone())
                .unwrap_or_default()
        };
        self.broadcast_to_instance(
            &clients,
            AcCmdCRRelayNotify {
                oid: command.oid,
                kind: command.kind,
                value: command.value,
                data: command.data,
            },
            Some(client_id),
        );
        Ok(())
    }

    fn handle_activate_interactive_event(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceActivateInteractiveEvent,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let (oid, clients) = {
            let state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            (racer.oid, instance.clients.clone())
        };

        self.broadcast_to_instance(
            &clients,
            AcCmdUserRaceActivateInteractiveEvent {
                event_id: command.event_id,
                character_oid: oid,
                group: command.group,
            },
            None,
        );
        Ok(())
    }

    fn handle_activate_event(
        &self,
        client_id: ClientId,
        command: AcCmdUserRaceActivateEvent,
    ) -> anyhow::Result<()> {
        let context = self.context(client_id)?;
        let (oid, clients) = {
            let state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get(&context.room_uid)
                .ok_or_else(|| anyhow::anyhow!("race instance {} is gone", context.room_uid))?;
            let racer = instance
                .tracker
                .racer(context.character_uid)
                .ok_or_else(|| anyhow::anyhow!("client is not a racer"))?;
            (racer.oid, instance.clients.clone())
        };

        self.broadcast_to_instance(
            &clients,
            AcCmdUserRaceActivateEvent {
                event_id: command.event_id,
                character_oid: oid,
            },
            None,
        );
        Ok(())
    }

    fn handle_change_skill_card_preset(
        &self,
        client_id: ClientId,
        command: AcCmdCRChangeSkillCardPresetID,
    ) -> anyhow::Result<()> {
        if command.set_id > 1 {
            return Ok(());
        }
        if !matches!(
            command.game_mode,
            ProtoGameMode::Speed | ProtoGameMode::Magic
        ) {
            return Ok(());
        }

        let context = self.context(client_id)?;
        let record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;

        record.mutable(|character| {
            let sets = match command.game_mode {
                ProtoGameMode::Magic => &mut character.skills.magic,
                _ => &mut character.skills.speed,
            };
            sets.active_set_id = command.set_id;
        });
        // No reply is defined for this command.
        Ok(())
    }

    #[cfg(test)]
    fn instance_stage(&self, room_uid: Uid) -> Option<&'static str> {
        let state = self.state.lock().unwrap();
        state.instances.get(&room_uid).map(|i| match i.stage {
            Stage::Waiting => "waiting",
            Stage::Loading => "loading",
            Stage::Racing => "racing",
            Stage::Finishing => "finishing",
        })
    }

    #[cfg(test)]
    fn force_stage_timeout(&self, room_uid: Uid) {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(&room_uid) {
            instance.stage_timeout_at = Instant::now() - Duration::from_millis(1);
        }
    }

    #[cfg(test)]
    fn with_racer_state<R>(
        &self,
        room_uid: Uid,
        character_uid: Uid,
        f: impl FnOnce(&crate::tracker::Racer) -> R,
    ) -> Option<R> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(&room_uid)
            .and_then(|i| i.tracker.racer(character_uid))
            .map(f)
    }
}

impl ServerEvents for RaceDirector {
    fn client_connected(&self, client_id: ClientId) {
        if let Some(addr) = self.server.client_address(client_id) {
            debug!(client = client_id, peer = %addr, "client connected to the race server");
        }
        self.state
            .lock()
            .unwrap()
            .clients
            .insert(client_id, ClientContext::default());
    }

    fn client_disconnected(&self, client_id: ClientId) {
        // leave_room ignores clients that never authenticated or already
        // left their room.
        self.leave_room(client_id, false);
        self.state.lock().unwrap().clients.remove(&client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Character, MemoryStore, SkillSet};

    fn character(uid: Uid, name: &str, level: u16) -> Character {
        let mut character = Character {
            uid,
            name: name.to_string(),
            gender: 0,
            level,
            carrots: 500,
            cash: 0,
            role: Default::default(),
            introduction: String::new(),
            mount_uid: INVALID_UID,
            horses: vec![],
            inventory: vec![],
            character_equipment: vec![],
            mount_equipment: vec![],
            settings_uid: INVALID_UID,
            guild_uid: INVALID_UID,
            pet_uid: INVALID_UID,
            is_ranch_locked: false,
            parts: Default::default(),
            appearance: Default::default(),
            skills: Default::default(),
        };
        character.skills.speed.set1 = SkillSet { slot1: 11, slot2: 12 };
        character.skills.magic.set1 = SkillSet { slot1: 21, slot2: 22 };
        character
    }

    struct Fixture {
        ctx: Arc<ServerContext>,
        director: Arc<RaceDirector>,
        room_uid: Uid,
    }

    /// A room with two admitted racers (clients 1 and 2, characters 100 and
    /// 200; 100 is master), configured for the given mode on map block 1.
    fn fixture(game_mode: rooms::GameMode) -> Fixture {
        let ctx = ServerContext::for_tests(Arc::new(MemoryStore::default()));
        ctx.data.characters.insert(100, character(100, "alice", 60));
        ctx.data.characters.insert(200, character(200, "bob", 60));

        let (room_uid, _) = ctx.rooms.create_room(|room| {
            let details = room.details_mut();
            details.name = "race".to_string();
            details.max_player_count = 8;
            details.game_mode = game_mode;
            details.course_id = 1;
            room.queue_player(100);
            room.queue_player(200);
        });

        let server = CommandServer::new("race-test");
        let director = RaceDirector::new(ctx.clone(), server);

        for (client, character_uid) in [(1u32, 100u32), (2, 200)] {
            director.client_connected(client);
            let code = ctx
                .otp
                .grant_code(otp::identity_hash(&[character_uid, room_uid]));
            director
                .handle_enter_room(
                    client,
                    AcCmdCREnterRoom {
                        character_uid,
                        one_time_password: code,
                        room_uid,
                    },
                )
                .unwrap();
        }

        Fixture {
            ctx,
            director,
            room_uid,
        }
    }

    fn start_race(f: &Fixture) {
        f.director.handle_start_race(1, AcCmdCRStartRace).unwrap();
    }

    fn oid_of(f: &Fixture, character_uid: Uid) -> Oid {
        f.director
            .with_racer_state(f.room_uid, character_uid, |racer| racer.oid)
            .unwrap()
    }

    #[tokio::test]
    async fn enter_room_admits_and_assigns_master() {
        let f = fixture(rooms::GameMode::Speed);

        let state = f.director.state.lock().unwrap();
        let instance = state.instances.get(&f.room_uid).unwrap();
        assert_eq!(instance.master_uid, 100);
        assert_eq!(instance.clients.len(), 2);
        drop(state);

        // Both players committed out of the queue.
        f.ctx
            .rooms
            .get_room(f.room_uid, |room| {
                assert_eq!(room.player_count(), 2);
                assert!(room.queued_players().is_empty());
            })
            .unwrap();
    }

    #[tokio::test]
    async fn bad_otp_is_refused() {
        let f = fixture(rooms::GameMode::Speed);
        f.director.client_connected(3);
        f.director
            .handle_enter_room(
                3,
                AcCmdCREnterRoom {
                    character_uid: 100,
                    one_time_password: 1,
                    room_uid: f.room_uid,
                },
            )
            .unwrap();
        assert!(!f.director.state.lock().unwrap().clients[&3].is_authenticated);
    }

    #[tokio::test]
    async fn non_master_cannot_start() {
        let f = fixture(rooms::GameMode::Speed);
        assert!(f.director.handle_start_race(2, AcCmdCRStartRace).is_err());
    }

    #[tokio::test]
    async fn start_race_seeds_loading_stage() {
        let f = fixture(rooms::GameMode::Speed);
        start_race(&f);

        assert_eq!(f.director.instance_stage(f.room_uid), Some("loading"));
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.state),
            Some(RacerState::Loading)
        );

        // Speed mode seeds items for both horseshoe decks on map 1.
        let state = f.director.state.lock().unwrap();
        let instance = state.instances.get(&f.room_uid).unwrap();
        assert_eq!(instance.tracker.items().len(), 3);
        assert!(f
            .ctx
            .rooms
            .get_room(f.room_uid, |room| room.is_playing())
            .unwrap());
    }

    #[tokio::test]
    async fn stage_machine_advances_when_all_load_and_finish() {
        let f = fixture(rooms::GameMode::Speed);
        start_race(&f);

        f.director
            .handle_loading_complete(1, AcCmdCRLoadingComplete)
            .unwrap();
        f.director.tick();
        // One straggler keeps the room loading.
        assert_eq!(f.director.instance_stage(f.room_uid), Some("loading"));

        f.director
            .handle_loading_complete(2, AcCmdCRLoadingComplete)
            .unwrap();
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("racing"));

        // Finishing starts with the first finisher and completes when all
        // are done.
        let oid1 = oid_of(&f, 100);
        f.director
            .handle_user_race_final(
                1,
                AcCmdUserRaceFinal {
                    oid: oid1,
                    course_time: 61_000,
                },
            )
            .unwrap();
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("finishing"));

        let oid2 = oid_of(&f, 200);
        f.director
            .handle_user_race_final(
                2,
                AcCmdUserRaceFinal {
                    oid: oid2,
                    course_time: 64_000,
                },
            )
            .unwrap();
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("waiting"));
        assert!(!f
            .ctx
            .rooms
            .get_room(f.room_uid, |room| room.is_playing())
            .unwrap());
    }

    #[tokio::test]
    async fn loading_timeout_demotes_stragglers() {
        let f = fixture(rooms::GameMode::Speed);
        start_race(&f);

        f.director
            .handle_loading_complete(1, AcCmdCRLoadingComplete)
            .unwrap();
        f.director.force_stage_timeout(f.room_uid);
        f.director.tick();

        assert_eq!(f.director.instance_stage(f.room_uid), Some("racing"));
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 200, |racer| racer.state),
            Some(RacerState::Disconnected)
        );
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.state),
            Some(RacerState::Racing)
        );
    }

    fn into_racing(f: &Fixture) {
        start_race(f);
        f.director
            .handle_loading_complete(1, AcCmdCRLoadingComplete)
            .unwrap();
        f.director
            .handle_loading_complete(2, AcCmdCRLoadingComplete)
            .unwrap();
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("racing"));
    }

    #[tokio::test]
    async fn perfect_jump_combo_awards_expected_points() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        let expected = [1200u32, 2600, 4200];
        for points in expected {
            f.director
                .handle_hurdle_clear_result(
                    1,
                    AcCmdCRHurdleClearResult {
                        character_oid: oid,
                        hurdle_clear_type: canterproto::common::HurdleClearType::Perfect,
                    },
                )
                .unwrap();
            assert_eq!(
                f.director
                    .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
                Some(points)
            );
        }
    }

    #[tokio::test]
    async fn collision_breaks_combo_and_awards_nothing() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        f.director
            .handle_hurdle_clear_result(
                1,
                AcCmdCRHurdleClearResult {
                    character_oid: oid,
                    hurdle_clear_type: canterproto::common::HurdleClearType::Perfect,
                },
            )
            .unwrap();
        f.director
            .handle_hurdle_clear_result(
                1,
                AcCmdCRHurdleClearResult {
                    character_oid: oid,
                    hurdle_clear_type: canterproto::common::HurdleClearType::Collision,
                },
            )
            .unwrap();

        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| (
                    racer.jump_combo_value,
                    racer.star_point_value
                )),
            Some((0, 1200))
        );
    }

    #[tokio::test]
    async fn acting_for_another_oid_is_fatal() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let other_oid = oid_of(&f, 200);

        let result = f.director.handle_star_point_get(
            1,
            AcCmdCRStarPointGet {
                character_oid: other_oid,
                gained_star_points: 100,
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spur_requires_full_gauge() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        assert!(f
            .director
            .handle_request_spur(
                1,
                AcCmdCRRequestSpur {
                    character_oid: oid,
                    active_boosters: 1,
                    combo_break: 0,
                },
            )
            .is_err());

        f.director
            .handle_star_point_get(
                1,
                AcCmdCRStarPointGet {
                    character_oid: oid,
                    gained_star_points: 50_000,
                },
            )
            .unwrap();
        // Clamped at the mode maximum.
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
            Some(40_000)
        );

        f.director
            .handle_request_spur(
                1,
                AcCmdCRRequestSpur {
                    character_oid: oid,
                    active_boosters: 1,
                    combo_break: 0,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
            Some(0)
        );
    }

    #[tokio::test]
    async fn magic_item_lifecycle() {
        let f = fixture(rooms::GameMode::Magic);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        f.director
            .handle_request_magic_item(1, AcCmdCRRequestMagicItem { character_oid: oid })
            .unwrap();

        let held = f
            .director
            .with_racer_state(f.room_uid, 100, |racer| racer.magic_item)
            .unwrap();
        assert!(matches!(held, Some(2) | Some(4) | Some(10)));
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
            Some(0)
        );

        // A second request while holding is ignored, not fatal.
        f.director
            .handle_request_magic_item(1, AcCmdCRRequestMagicItem { character_oid: oid })
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.magic_item),
            Some(held)
        );

        // Using it consumes it.
        f.director
            .handle_use_magic_item(
                1,
                AcCmdCRUseMagicItem {
                    character_oid: oid,
                    magic_item_id: held.unwrap(),
                    target_oids: vec![],
                    cast_time: None,
                    effect_duration: None,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.magic_item),
            Some(None)
        );
    }

    #[tokio::test]
    async fn bolt_strips_target_item() {
        let f = fixture(rooms::GameMode::Magic);
        into_racing(&f);
        let oid1 = oid_of(&f, 100);
        let oid2 = oid_of(&f, 200);

        // Both racers pick up items; force the attacker's to a bolt.
        f.director
            .handle_request_magic_item(1, AcCmdCRRequestMagicItem { character_oid: oid1 })
            .unwrap();
        f.director
            .handle_request_magic_item(2, AcCmdCRRequestMagicItem { character_oid: oid2 })
            .unwrap();
        {
            let mut state = f.director.state.lock().unwrap();
            let instance = state.instances.get_mut(&f.room_uid).unwrap();
            instance.tracker.racer_mut(100).unwrap().magic_item = Some(MAGIC_ITEM_BOLT);
        }

        f.director
            .handle_use_magic_item(
                1,
                AcCmdCRUseMagicItem {
                    character_oid: oid1,
                    magic_item_id: MAGIC_ITEM_BOLT,
                    target_oids: vec![],
                    cast_time: None,
                    effect_duration: None,
                },
            )
            .unwrap();

        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 200, |racer| racer.magic_item),
            Some(None)
        );
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.magic_item),
            Some(None)
        );
    }

    #[tokio::test]
    async fn targeting_flow_clears_state() {
        let f = fixture(rooms::GameMode::Magic);
        into_racing(&f);
        let oid1 = oid_of(&f, 100);
        let oid2 = oid_of(&f, 200);

        f.director
            .handle_start_magic_target(1, AcCmdCRStartMagicTarget { character_oid: oid1 })
            .unwrap();
        f.director
            .handle_change_magic_target_notify(
                1,
                AcCmdCRChangeMagicTargetNotify {
                    character_oid: oid1,
                    target_oid: oid2,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| (racer.is_targeting, racer.current_target)),
            Some((true, oid2))
        );

        f.director
            .handle_change_magic_target_ok(
                1,
                AcCmdCRChangeMagicTargetOK {
                    character_oid: oid1,
                    target_oid: oid2,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| (racer.is_targeting, racer.current_target)),
            Some((false, INVALID_OID))
        );
    }

    #[tokio::test]
    async fn item_pickup_math_and_respawn_bookkeeping() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        let (gold_oid, silver_oid) = {
            let state = f.director.state.lock().unwrap();
            let instance = state.instances.get(&f.room_uid).unwrap();
            let gold = instance
                .tracker
                .items()
                .values()
                .find(|item| item.deck_id == 101)
                .unwrap()
                .oid;
            let silver = instance
                .tracker
                .items()
                .values()
                .find(|item| item.deck_id == 102)
                .unwrap()
                .oid;
            (gold, silver)
        };

        // Silver first: flat 10k.
        f.director
            .handle_race_item_get(
                1,
                AcCmdUserRaceItemGet {
                    character_oid: oid,
                    item_oid: silver_oid,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
            Some(10_000)
        );

        // Gold: up to the next 40k multiple.
        f.director
            .handle_race_item_get(
                1,
                AcCmdUserRaceItemGet {
                    character_oid: oid,
                    item_oid: gold_oid,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.star_point_value),
            Some(40_000)
        );

        // Pickup wiped the item from every tracked set.
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 200, |racer| racer
                    .tracked_items
                    .contains(&gold_oid)),
            Some(false)
        );
    }

    #[tokio::test]
    async fn proximity_spawns_are_idempotent() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);
        let oid = oid_of(&f, 100);

        let near = {
            let state = f.director.state.lock().unwrap();
            let instance = state.instances.get(&f.room_uid).unwrap();
            instance.tracker.items().values().next().unwrap().position
        };

        let update = AcCmdUserRaceUpdatePos {
            oid,
            position: [near[0] + 1.0, near[1], near[2]],
            heading: 0.0,
        };
        f.director.handle_race_user_pos(1, update).unwrap();
        let tracked_after_first = f
            .director
            .with_racer_state(f.room_uid, 100, |racer| racer.tracked_items.len())
            .unwrap();
        assert!(tracked_after_first >= 1);

        // Same position again: no growth.
        f.director.handle_race_user_pos(1, update).unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.tracked_items.len()),
            Some(tracked_after_first)
        );

        // Riding far away forgets the items.
        f.director
            .handle_race_user_pos(
                1,
                AcCmdUserRaceUpdatePos {
                    oid,
                    position: [99_999.0, 99_999.0, 99_999.0],
                    heading: 0.0,
                },
            )
            .unwrap();
        assert_eq!(
            f.director
                .with_racer_state(f.room_uid, 100, |racer| racer.tracked_items.len()),
            Some(0)
        );
    }

    #[tokio::test]
    async fn leave_room_promotes_master_and_reaps_empty_rooms() {
        let f = fixture(rooms::GameMode::Speed);

        // The master leaves; bob inherits the room.
        f.director.leave_room(1, true);
        {
            let state = f.director.state.lock().unwrap();
            let instance = state.instances.get(&f.room_uid).unwrap();
            assert_eq!(instance.master_uid, 200);
            assert_eq!(instance.clients.len(), 1);
        }

        // The last player leaves; room and instance disappear.
        f.director.leave_room(2, true);
        assert!(f.director.state.lock().unwrap().instances.is_empty());
        assert!(!f.ctx.rooms.room_exists(f.room_uid));
    }

    #[tokio::test]
    async fn race_timeout_moves_to_finishing() {
        let f = fixture(rooms::GameMode::Speed);
        into_racing(&f);

        f.director.force_stage_timeout(f.room_uid);
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("finishing"));

        f.director.force_stage_timeout(f.room_uid);
        f.director.tick();
        assert_eq!(f.director.instance_stage(f.room_uid), Some("waiting"));
    }

    #[tokio::test]
    async fn skill_preset_change_persists() {
        let f = fixture(rooms::GameMode::Speed);
        f.director
            .handle_change_skill_card_preset(
                1,
                AcCmdCRChangeSkillCardPresetID {
                    set_id: 1,
                    game_mode: ProtoGameMode::Speed,
                },
            )
            .unwrap();
        let record = f.ctx.data.character(100).unwrap();
        assert_eq!(record.immutable(|c| c.skills.speed.active_set_id), 1);

        // Out-of-range set ids are ignored.
        f.director
            .handle_change_skill_card_preset(
                1,
                AcCmdCRChangeSkillCardPresetID {
                    set_id: 5,
                    game_mode: ProtoGameMode::Speed,
                },
            )
            .unwrap();
        assert_eq!(record.immutable(|c| c.skills.speed.active_set_id), 1);
    }
}
