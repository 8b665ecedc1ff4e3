use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use canterproto::common::{GameMode, SystemContent, TeamMode, Uid, INVALID_UID};
use canterproto::lobby::*;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::directors::ranch::RanchDirector;
use crate::locale;
use crate::net::{ClientId, CommandServer, ServerEvents};
use crate::otp;
use crate::protohelp;
use crate::records::CharacterRole;
use crate::registry;
use crate::rooms;
use crate::scheduler::Scheduler;

/// How long a queued seat survives before the lobby reclaims it if the
/// player never arrived at the race endpoint.
const ROOM_QUEUE_GRACE: Duration = Duration::from_secs(7);

const ROOMS_PER_PAGE: usize = 9;

#[derive(Debug, Clone, Default)]
struct ClientContext {
    is_authenticated: bool,
    just_created_character: bool,
    user_name: String,
    character_uid: Uid,
    rancher_visit_preference: Uid,
}

#[derive(Debug, Clone, Default)]
struct QueuedLogin {
    user_name: String,
    user_token: String,
    user_load_requested: bool,
    user_character_load_requested: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserInstance {
    pub user_name: String,
    pub character_uid: Uid,
    pub room_uid: Uid,
}

#[derive(Default)]
struct LobbyState {
    clients: HashMap<ClientId, ClientContext>,
    client_logins: HashMap<ClientId, QueuedLogin>,
    login_request_queue: VecDeque<ClientId>,
    login_response_queue: VecDeque<ClientId>,
    user_instances: HashMap<String, UserInstance>,
    /// Pending guild invites: guild uid to invited character uids.
    guild_invites: HashMap<Uid, Vec<Uid>>,
    /// Characters operators sent back to the character creator.
    forced_into_creator: HashSet<Uid>,
    system_content: Vec<(u8, u32)>,
    scheduler: Scheduler,
}

/// The lobby endpoint: admission, matchmaking, and handoff.
///
/// Logins flow through an ordered two-stage queue drained one head per
/// stage per tick, which backpressures record loads without ever blocking
/// the command server's read loops.
pub struct LobbyDirector {
    ctx: Arc<ServerContext>,
    server: Arc<CommandServer>,
    weak: std::sync::Weak<Self>,
    ranch: OnceLock<Arc<RanchDirector>>,
    state: Mutex<LobbyState>,
}

impl LobbyDirector {
    pub fn new(ctx: Arc<ServerContext>, server: Arc<CommandServer>) -> Arc<Self> {
        let director = Arc::new_cyclic(|weak| Self {
            ctx,
            server,
            weak: weak.clone(),
            ranch: OnceLock::new(),
            state: Mutex::new(LobbyState::default()),
        });

        director.register_handlers();
        director
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("lobby director alive")
    }

    /// Wires the ranch director for cross-endpoint notifies.
    pub fn set_ranch_director(&self, ranch: Arc<RanchDirector>) {
        let _ = self.ranch.set(ranch);
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

        handle!(AcCmdCLLogin, handle_login);
        handle!(AcCmdCLCreateNickname, handle_create_nickname);
        handle!(AcCmdCLShowInventory, handle_show_inventory);
        handle!(AcCmdCLRoomList, handle_room_list);
        handle!(AcCmdCLMakeRoom, handle_make_room);
        handle!(AcCmdCLEnterRoom, handle_enter_room);
        handle!(AcCmdCLLeaveRoom, handle_leave_room);
        handle!(AcCmdCLEnterRanch, handle_enter_ranch);
        handle!(AcCmdCLEnterRanchRandomly, handle_enter_ranch_randomly);
        handle!(AcCmdCLEnterChannel, handle_enter_channel);
        handle!(AcCmdCLLeaveChannel, handle_leave_channel);
        handle!(AcCmdCLHeartbeat, handle_heartbeat);
        handle!(AcCmdCLQueryServerTime, handle_query_server_time);
        handle!(AcCmdCLGetMessengerInfo, handle_get_messenger_info);
        handle!(AcCmdCLCheckWaitingSeqno, handle_check_waiting_seqno);
        handle!(
            AcCmdCLAchievementCompleteList,
            handle_achievement_complete_list
        );
        handle!(AcCmdCLRequestQuestList, handle_request_quest_list);
        handle!(
            AcCmdCLRequestDailyQuestList,
            handle_request_daily_quest_list
        );
        handle!(
            AcCmdCLRequestSpecialEventList,
            handle_request_special_event_list
        );
        handle!(AcCmdCLRequestLeagueInfo, handle_request_league_info);
        handle!(AcCmdCLRequestPersonalInfo, handle_request_personal_info);
        handle!(AcCmdCLRequestMountInfo, handle_request_mount_info);
        handle!(AcCmdCLSetIntroduction, handle_set_introduction);
        handle!(AcCmdCLGoodsShopList, handle_goods_shop_list);
        handle!(AcCmdCLUpdateSystemContent, handle_update_system_content);
        handle!(AcCmdCLAcceptInviteToGuild, handle_accept_invite_to_guild);
        handle!(AcCmdCLDeclineInviteToGuild, handle_decline_invite_to_guild);
        handle!(AcCmdCLUpdateUserSettings, handle_update_user_settings);
    }

    /// Drains the scheduler and advances both login queues: at most one
    /// response and one request head per tick.
    pub fn tick(&self) {
        let due = {
            let mut state = self.state.lock().unwrap();
            state.scheduler.drain_due(Instant::now())
        };
        for task in due {
            task();
        }

        self.process_response_queue();
        self.process_request_queue();
    }

    fn process_response_queue(&self) {
        loop {
            let (client_id, login) = {
                let state = self.state.lock().unwrap();
                let Some(client_id) = state.login_response_queue.front().copied() else {
                    return;
                };
                let Some(login) = state.client_logins.get(&client_id).cloned() else {
                    // Stale head; drop it and look again.
                    drop(state);
                    self.pop_response_head(client_id);
                    continue;
                };
                (client_id, login)
            };

            // A requested character load that is still in flight parks the
            // whole queue until the next tick.
            if login.user_character_load_requested
                && self.ctx.data.are_data_being_loaded(&login.user_name)
            {
                return;
            }

            let Some(user_record) = self.ctx.data.user(&login.user_name) else {
                self.pop_response_head(client_id);
                self.reject_login(client_id, LoginCancelReason::Generic);
                return;
            };
            let character_uid = user_record.immutable(|user| user.character_uid);
            let has_character = character_uid != INVALID_UID;

            if has_character && !login.user_character_load_requested {
                self.ctx
                    .data
                    .request_load_character_data(login.user_name.clone(), character_uid);
                let mut state = self.state.lock().unwrap();
                if let Some(login) = state.client_logins.get_mut(&client_id) {
                    login.user_character_load_requested = true;
                }
                return;
            }

            self.pop_response_head(client_id);

            let forced_creator = {
                let mut state = self.state.lock().unwrap();
                state.forced_into_creator.remove(&character_uid)
            };

            if !has_character || forced_creator {
                debug!(
                    user = %login.user_name,
                    client = client_id,
                    "authenticated; sent to the character creator"
                );
                self.accept_login(client_id, true);
                return;
            }

            if !self.ctx.data.are_character_data_loaded(&login.user_name) {
                warn!(user = %login.user_name, "character data unavailable");
                self.reject_login(client_id, LoginCancelReason::Generic);
                return;
            }

            {
                let mut state = self.state.lock().unwrap();
                if state.user_instances.contains_key(&login.user_name) {
                    drop(state);
                    self.reject_login(client_id, LoginCancelReason::Duplicated);
                    return;
                }
                state.user_instances.insert(
                    login.user_name.clone(),
                    UserInstance {
                        user_name: login.user_name.clone(),
                        character_uid,
                        room_uid: INVALID_UID,
                    },
                );
                state.client_logins.remove(&client_id);
            }

            info!(user = %login.user_name, client = client_id, "user logged in");
            self.accept_login(client_id, false);
            return;
        }
    }

    fn process_request_queue(&self) {
        let (client_id, login) = {
            let state = self.state.lock().unwrap();
            let Some(client_id) = state.login_request_queue.front().copied() else {
                return;
            };
            let Some(login) = state.client_logins.get(&client_id).cloned() else {
                return;
            };
            (client_id, login)
        };

        if !login.user_load_requested {
            self.ctx.data.request_load_user_data(login.user_name.clone());
            let mut state = self.state.lock().unwrap();
            if let Some(login) = state.client_logins.get_mut(&client_id) {
                login.user_load_requested = true;
            }
            return;
        }

        if self.ctx.data.are_data_being_loaded(&login.user_name) {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.login_request_queue.retain(|c| *c != client_id);
        }

        if !self.ctx.data.are_user_data_loaded(&login.user_name) {
            warn!(user = %login.user_name, "user data unavailable");
            self.reject_login(client_id, LoginCancelReason::Generic);
            return;
        }

        let user_record = self.ctx.data.user(&login.user_name).expect("user loaded");
        let authenticated = user_record.immutable(|user| user.token == login.user_token);
        if !authenticated {
            debug!(user = %login.user_name, "token mismatch");
            self.reject_login(client_id, LoginCancelReason::InvalidUser);
            return;
        }

        let verdict = self.ctx.infractions.check_outstanding(&login.user_name);
        if verdict.prevent_server_joining {
            self.reject_login(client_id, LoginCancelReason::DisconnectYourself);
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.login_response_queue.push_back(client_id);
    }

    fn pop_response_head(&self, client_id: ClientId) {
        let mut state = self.state.lock().unwrap();
        state.login_response_queue.retain(|c| *c != client_id);
    }

    fn accept_login(&self, client_id: ClientId, to_character_creator: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(context) = state.clients.get_mut(&client_id) else {
                // The client disconnected while their login settled.
                return;
            };
            context.is_authenticated = true;
        }

        if to_character_creator {
            self.server
                .queue_command(client_id, || AcCmdLCCreateNicknameNotify);
        } else {
            self.send_login_ok(client_id);
        }
    }

    fn reject_login(&self, client_id: ClientId, reason: LoginCancelReason) {
        self.server
            .queue_command(client_id, move || AcCmdCLLoginCancel { reason });
    }

    fn send_login_ok(&self, client_id: ClientId) {
        let (user_name, just_created) = {
            let state = self.state.lock().unwrap();
            match state.clients.get(&client_id) {
                Some(context) => (context.user_name.clone(), context.just_created_character),
                None => return,
            }
        };

        let Some(user_record) = self.ctx.data.user(&user_name) else {
            warn!(user = %user_name, "user record unavailable for login ok");
            return;
        };
        let character_uid = user_record.immutable(|user| user.character_uid);

        let Some(character_record) = self.ctx.data.character(character_uid) else {
            warn!(user = %user_name, character = character_uid, "character record unavailable");
            return;
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(context) = state.clients.get_mut(&client_id) {
                context.character_uid = character_uid;
            }
            if let Some(instance) = state.user_instances.get_mut(&user_name) {
                instance.character_uid = character_uid;
            }
        }

        let ranch = self.ctx.config.ranch.advertised();
        let system_content = {
            let state = self.state.lock().unwrap();
            SystemContent {
                values: state.system_content.clone(),
            }
        };

        let response = character_record.immutable(|character| {
            let mount = character_mount(&self.ctx, character);
            AcCmdCLLoginOK {
                lobby_time: unix_time_micros(),
                uid: character.uid,
                name: character.name.clone(),
                motd: if just_created {
                    "Saddle up! Your first mount is waiting at the ranch.".to_string()
                } else {
                    String::new()
                },
                gender: character.gender,
                introduction: character.introduction.clone(),
                level: character.level,
                carrots: character.carrots,
                cash: character.cash,
                role: character.role as u8,
                character_parts: protohelp::build_character_parts(&character.parts),
                character_appearance: protohelp::build_character_appearance(&character.appearance),
                character_equipment: protohelp::build_items(
                    &self.ctx.data,
                    &character.character_equipment,
                ),
                mount_equipment: protohelp::build_items(&self.ctx.data, &character.mount_equipment),
                mount,
                guild: character_guild(&self.ctx, character),
                ranch_address: u32::from(ranch.address),
                ranch_port: ranch.port,
                scrambling_constant: 0,
                system_content,
            }
        });

        self.server.queue_command(client_id, move || response);

        // Operator notice follows the login payload.
        let notice = self
            .ctx
            .config
            .notice_template
            .replace("{players_online}", &self.online_count().to_string());
        if !notice.is_empty() {
            self.server
                .queue_command(client_id, move || AcCmdLCNotice { notice });
        }
    }

    fn online_count(&self) -> usize {
        self.state.lock().unwrap().user_instances.len()
    }

    fn authenticated(&self, client_id: ClientId) -> anyhow::Result<ClientContext> {
        let state = self.state.lock().unwrap();
        let context = state
            .clients
            .get(&client_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("lobby client {client_id} is not available"))?;
        if !context.is_authenticated {
            anyhow::bail!("lobby client {client_id} is not authenticated");
        }
        Ok(context)
    }

    fn handle_login(&self, client_id: ClientId, command: AcCmdCLLogin) -> anyhow::Result<()> {
        if command.constant0 != PROTOCOL_CONSTANT0 || command.constant1 != PROTOCOL_CONSTANT1 {
            self.reject_login(client_id, LoginCancelReason::InvalidVersion);
            return Ok(());
        }

        if command.login_id.is_empty() || command.auth_key.is_empty() {
            self.reject_login(client_id, LoginCancelReason::InvalidLoginId);
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();

            // A live authenticated session under this name beats the
            // newcomer outright.
            let already_live = state
                .clients
                .values()
                .any(|c| c.user_name == command.login_id && c.is_authenticated);
            if already_live {
                drop(state);
                self.reject_login(client_id, LoginCancelReason::Duplicated);
                return Ok(());
            }

            let Some(context) = state.clients.get_mut(&client_id) else {
                return Ok(());
            };
            context.user_name = command.login_id.clone();

            let Some(login) = state.client_logins.get_mut(&client_id) else {
                anyhow::bail!("client {client_id} has no login slot");
            };
            login.user_name = locale::from_wire(&command.login_id);
            login.user_token = command.auth_key;
            state.login_request_queue.push_back(client_id);
        }

        debug!(user = %command.login_id, client = client_id, "login queued");
        Ok(())
    }

    fn handle_create_nickname(
        &self,
        client_id: ClientId,
        command: AcCmdCLCreateNickname,
    ) -> anyhow::Result<()> {
        let nickname = locale::from_wire(&command.nickname);
        if !locale::is_name_valid(&nickname, 16) {
            self.reject_login(client_id, LoginCancelReason::Generic);
            return Ok(());
        }

        let user_name = {
            let mut state = self.state.lock().unwrap();
            let Some(context) = state.clients.get_mut(&client_id) else {
                return Ok(());
            };
            context.just_created_character = true;
            context.user_name.clone()
        };

        let user_record = self
            .ctx
            .data
            .user(&user_name)
            .ok_or_else(|| anyhow::anyhow!("user record for '{user_name}' does not exist"))?;
        let existing_uid = user_record.immutable(|user| user.character_uid);

        let character_record = if existing_uid == INVALID_UID {
            // Fresh character: new mount with a randomized look first.
            let mount_record = self.ctx.data.create_horse(|horse| {
                horse.tid = 20002;
                horse.name = nickname.clone();
                horse.stamina = 3500;
                horse.growth_points = 150;
                registry::HorseRegistry::build_random_horse(&mut horse.parts, &mut horse.appearance);
            });
            let mount_uid = mount_record.immutable(|horse| horse.uid);

            let character_record = self.ctx.data.create_character(|character| {
                character.name = nickname.clone();
                character.level = 60;
                character.carrots = 10_000;
                character.mount_uid = mount_uid;
                character.horses = vec![mount_uid];
            });
            let character_uid = character_record.immutable(|character| character.uid);

            user_record.mutable(|user| user.character_uid = character_uid);
            info!(user = %user_name, character = character_uid, "character created");
            character_record
        } else {
            self.ctx
                .data
                .character(existing_uid)
                .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?
        };

        character_record.mutable(|character| {
            character.parts = crate::records::CharacterParts {
                model_id: command.parts.model_id,
                mouth_id: command.parts.mouth_id,
                face_id: command.parts.face_id,
            };
            character.appearance = crate::records::CharacterAppearance {
                voice_id: command.appearance.voice_id,
                head_size: command.appearance.head_size,
                height: command.appearance.height,
                thigh_volume: command.appearance.thigh_volume,
                leg_volume: command.appearance.leg_volume,
                emblem_id: command.appearance.emblem_id,
            };
        });

        // Admission completes with the fresh character.
        {
            let mut state = self.state.lock().unwrap();
            let character_uid = character_record.immutable(|c| c.uid);
            if !state.user_instances.contains_key(&user_name) {
                state.user_instances.insert(
                    user_name.clone(),
                    UserInstance {
                        user_name: user_name.clone(),
                        character_uid,
                        room_uid: INVALID_UID,
                    },
                );
            }
            state.client_logins.remove(&client_id);
        }

        self.send_login_ok(client_id);
        Ok(())
    }

    fn handle_show_inventory(
        &self,
        client_id: ClientId,
        _command: AcCmdCLShowInventory,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;
        let character_record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;

        let response = character_record.immutable(|character| AcCmdCLShowInventoryOK {
            items: protohelp::build_items(&self.ctx.data, &character.inventory),
            horses: self
                .ctx
                .data
                .horses
                .get_many(&character.horses)
                .iter()
                .map(|record| record.immutable(protohelp::build_horse))
                .collect(),
        });

        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_room_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLRoomList,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;

        let snapshots = self.ctx.rooms.get_rooms_snapshot();
        let matching: Vec<_> = snapshots
            .into_iter()
            .filter(|room| {
                room_game_mode(room.details.game_mode) == command.game_mode
                    && room_team_mode(room.details.team_mode) == command.team_mode
            })
            .collect();

        let pages = matching.chunks(ROOMS_PER_PAGE).collect::<Vec<_>>();
        let page_index = (command.page as usize).min(pages.len().saturating_sub(1));

        let rooms = pages
            .get(page_index)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|room| RoomListEntry {
                        uid: room.uid,
                        name: room.details.name.clone(),
                        state: if room.is_playing {
                            RoomListState::Playing
                        } else {
                            RoomListState::Waiting
                        },
                        is_locked: !room.details.password.is_empty(),
                        player_count: room.player_count as u8,
                        max_player_count: room.details.max_player_count as u8,
                        skill_bracket: room.details.skill_bracket,
                        map: room.details.course_id,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let response = AcCmdCLRoomListOK {
            page: page_index as u8,
            game_mode: command.game_mode,
            team_mode: command.team_mode,
            rooms,
        };
        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_make_room(
        &self,
        client_id: ClientId,
        command: AcCmdCLMakeRoom,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        // Only training rooms may go unnamed.
        let is_training = command.player_count == 1;
        if command.name.is_empty() && !is_training {
            self.server
                .queue_command(client_id, || AcCmdCLMakeRoomCancel);
            return Ok(());
        }

        let character_uid = context.character_uid;
        let (room_uid, _) = self.ctx.rooms.create_room(|room| {
            let details = room.details_mut();
            details.name = locale::from_wire(&command.name);
            details.password = command.password.clone();
            details.mission_id = command.mission_id;
            details.max_player_count = u32::from(command.player_count.min(8));
            details.game_mode = match command.game_mode {
                GameMode::Speed => rooms::GameMode::Speed,
                GameMode::Magic => rooms::GameMode::Magic,
                GameMode::Guild => rooms::GameMode::Guild,
                GameMode::Tutorial => rooms::GameMode::Tutorial,
            };
            details.team_mode = match command.team_mode {
                TeamMode::Team => rooms::TeamMode::Team,
                TeamMode::Ffa | TeamMode::Single => rooms::TeamMode::Solo,
            };
            details.npc_race = command.npc_race;
            details.skill_bracket = command.skill_bracket;
            // New rooms default to the rotating "hot" course selection.
            details.course_id = registry::HOT_MAPS_COURSE_ID;

            room.queue_player(character_uid);
        });

        let code = self
            .ctx
            .otp
            .grant_code(otp::identity_hash(&[character_uid, room_uid]));

        let race = self.ctx.config.race.advertised();
        let response = AcCmdCLMakeRoomOK {
            room_uid,
            one_time_password: code,
            race_address: u32::from(race.address),
            race_port: race.port,
        };
        info!(character = character_uid, room = room_uid, "room created");
        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_enter_room(
        &self,
        client_id: ClientId,
        command: AcCmdCLEnterRoom,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;
        let character_uid = context.character_uid;

        enum Admission {
            Ok,
            BadPassword,
            Full,
        }

        let admission = self.ctx.rooms.get_room(command.room_uid, |room| {
            let password_ok =
                room.details().password.is_empty() || room.details().password == command.password;
            if !password_ok {
                return Admission::BadPassword;
            }
            if room.is_full() {
                return Admission::Full;
            }
            room.queue_player(character_uid);
            Admission::Ok
        });

        let status = match admission {
            Err(_) => Some(EnterRoomCancelStatus::InvalidRoom),
            Ok(Admission::BadPassword) => Some(EnterRoomCancelStatus::BadPassword),
            Ok(Admission::Full) => Some(EnterRoomCancelStatus::CrowdedRoom),
            Ok(Admission::Ok) => None,
        };
        if let Some(status) = status {
            self.server
                .queue_command(client_id, move || AcCmdCLEnterRoomCancel { status });
            return Ok(());
        }

        let code = self
            .ctx
            .otp
            .grant_code(otp::identity_hash(&[character_uid, command.room_uid]));

        let race = self.ctx.config.race.advertised();
        let room_uid = command.room_uid;
        let response = AcCmdCLEnterRoomOK {
            room_uid,
            one_time_password: code,
            race_address: u32::from(race.address),
            race_port: race.port,
        };
        self.server.queue_command(client_id, move || response);

        // Reclaim the queued seat if the player never shows up at the race
        // endpoint; mark their room otherwise.
        let this = self.arc();
        let user_name = context.user_name;
        let mut state = self.state.lock().unwrap();
        state
            .scheduler
            .queue_at(Instant::now() + ROOM_QUEUE_GRACE, move || {
                let mut entered = false;
                if this.ctx.rooms.room_exists(room_uid) {
                    let _ = this.ctx.rooms.get_room(room_uid, |room| {
                        entered = !room.dequeue_player(character_uid);
                    });
                }
                if entered {
                    let mut state = this.state.lock().unwrap();
                    if let Some(instance) = state.user_instances.get_mut(&user_name) {
                        instance.room_uid = room_uid;
                    }
                }
            });
        Ok(())
    }

    fn handle_leave_room(
        &self,
        client_id: ClientId,
        _command: AcCmdCLLeaveRoom,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;
        let this = self.arc();
        let user_name = context.user_name;
        let mut state = self.state.lock().unwrap();
        state.scheduler.queue(move || {
            let mut state = this.state.lock().unwrap();
            if let Some(instance) = state.user_instances.get_mut(&user_name) {
                instance.room_uid = INVALID_UID;
            }
        });
        Ok(())
    }

    fn handle_enter_ranch(
        &self,
        client_id: ClientId,
        command: AcCmdCLEnterRanch,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let rancher_record = self.ctx.data.character(command.rancher_uid);
        let is_locked = rancher_record
            .map(|record| record.immutable(|rancher| rancher.is_ranch_locked))
            .unwrap_or(true);
        let entering_own = command.rancher_uid == context.character_uid;

        if is_locked && !entering_own {
            self.server
                .queue_command(client_id, || AcCmdCLEnterRanchCancel);
            return Ok(());
        }

        self.send_enter_ranch_ok(client_id, context.character_uid, command.rancher_uid);
        Ok(())
    }

    fn handle_enter_ranch_randomly(
        &self,
        client_id: ClientId,
        _command: AcCmdCLEnterRanchRandomly,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        // A pending visit preference wins, and is one-shot.
        let mut rancher_uid = {
            let mut state = self.state.lock().unwrap();
            let Some(client) = state.clients.get_mut(&client_id) else {
                return Ok(());
            };
            std::mem::replace(&mut client.rancher_visit_preference, INVALID_UID)
        };

        if rancher_uid == INVALID_UID {
            let mut candidates: Vec<Uid> = Vec::new();
            for uid in self.ctx.data.characters.keys() {
                if uid == context.character_uid {
                    continue;
                }
                if let Some(record) = self.ctx.data.character(uid) {
                    if !record.immutable(|c| c.is_ranch_locked) {
                        candidates.push(uid);
                    }
                }
            }

            rancher_uid = if candidates.is_empty() {
                context.character_uid
            } else {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            };
        }

        self.send_enter_ranch_ok(client_id, context.character_uid, rancher_uid);
        Ok(())
    }

    fn send_enter_ranch_ok(&self, client_id: ClientId, character_uid: Uid, rancher_uid: Uid) {
        let code = self.ctx.otp.grant_code(otp::identity_hash(&[character_uid]));
        let ranch = self.ctx.config.ranch.advertised();
        let response = AcCmdCLEnterRanchOK {
            rancher_uid,
            one_time_password: code,
            ranch_address: u32::from(ranch.address),
            ranch_port: ranch.port,
        };
        self.server.queue_command(client_id, move || response);
    }

    fn handle_enter_channel(
        &self,
        client_id: ClientId,
        command: AcCmdCLEnterChannel,
    ) -> anyhow::Result<()> {
        let population = self.server.client_count() as u16;
        self.server.queue_command(client_id, move || AcCmdCLEnterChannelOK {
            channel: command.channel,
            population,
        });
        Ok(())
    }

    fn handle_leave_channel(
        &self,
        client_id: ClientId,
        _command: AcCmdCLLeaveChannel,
    ) -> anyhow::Result<()> {
        self.server
            .queue_command(client_id, || AcCmdCLLeaveChannelOK);
        Ok(())
    }

    fn handle_heartbeat(
        &self,
        _client_id: ClientId,
        _command: AcCmdCLHeartbeat,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_query_server_time(
        &self,
        client_id: ClientId,
        _command: AcCmdCLQueryServerTime,
    ) -> anyhow::Result<()> {
        self.server.queue_command(client_id, || AcCmdCLQueryServerTimeOK {
            lobby_time: unix_time_micros(),
        });
        Ok(())
    }

    fn handle_get_messenger_info(
        &self,
        client_id: ClientId,
        _command: AcCmdCLGetMessengerInfo,
    ) -> anyhow::Result<()> {
        // No dedicated messenger service; advertise the lobby itself.
        let lobby = self.ctx.config.lobby.advertised();
        self.server.queue_command(client_id, move || AcCmdCLGetMessengerInfoOK {
            code: 0xDEAD,
            address: u32::from(lobby.address),
            port: lobby.port,
        });
        Ok(())
    }

    fn handle_check_waiting_seqno(
        &self,
        client_id: ClientId,
        _command: AcCmdCLCheckWaitingSeqno,
    ) -> anyhow::Result<()> {
        let position = {
            let state = self.state.lock().unwrap();
            let request_pos = state
                .login_request_queue
                .iter()
                .position(|c| *c == client_id)
                .unwrap_or(0);
            let response_pos = state
                .login_response_queue
                .iter()
                .position(|c| *c == client_id)
                .unwrap_or(0);
            (request_pos + response_pos) as u32
        };

        self.server
            .queue_command(client_id, move || AcCmdCLCheckWaitingSeqnoOK { position });
        Ok(())
    }

    fn handle_achievement_complete_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLAchievementCompleteList,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;
        let character_uid = if command.character_uid != INVALID_UID {
            command.character_uid
        } else {
            context.character_uid
        };

        self.server.queue_command(client_id, move || AcCmdCLAchievementCompleteListOK {
            character_uid,
            achievements: Vec::new(),
        });
        Ok(())
    }

    fn handle_request_quest_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLRequestQuestList,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;
        self.server.queue_command(client_id, move || AcCmdCLRequestQuestListOK {
            character_uid: command.character_uid,
            quests: Vec::new(),
        });
        Ok(())
    }

    fn handle_request_daily_quest_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLRequestDailyQuestList,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;
        self.server.queue_command(client_id, move || AcCmdCLRequestDailyQuestListOK {
            character_uid: command.character_uid,
            quests: Vec::new(),
        });
        Ok(())
    }

    fn handle_request_special_event_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLRequestSpecialEventList,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;
        self.server.queue_command(client_id, move || AcCmdCLRequestSpecialEventListOK {
            character_uid: command.character_uid,
            events: Vec::new(),
        });
        Ok(())
    }

    fn handle_request_league_info(
        &self,
        client_id: ClientId,
        _command: AcCmdCLRequestLeagueInfo,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;
        self.server
            .queue_command(client_id, AcCmdCLRequestLeagueInfoOK::default);
        Ok(())
    }

    fn handle_request_personal_info(
        &self,
        client_id: ClientId,
        command: AcCmdCLRequestPersonalInfo,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;

        let character_record = self
            .ctx
            .data
            .character(command.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;

        let response = character_record.immutable(|character| {
            let guild_name = self
                .ctx
                .data
                .guild(character.guild_uid)
                .map(|record| record.immutable(|guild| guild.name.clone()))
                .unwrap_or_default();

            AcCmdLCPersonalInfo {
                character_uid: character.uid,
                kind: command.kind as u8,
                level: character.level,
                introduction: character.introduction.clone(),
                guild_name,
            }
        });

        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_request_mount_info(
        &self,
        client_id: ClientId,
        command: AcCmdCLRequestMountInfo,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let character_record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;

        let mount_uids = character_record.immutable(|character| {
            let mut uids = character.horses.clone();
            if character.mount_uid != INVALID_UID && !uids.contains(&character.mount_uid) {
                uids.push(character.mount_uid);
            }
            uids
        });

        let mounts = self
            .ctx
            .data
            .horses
            .get_many(&mount_uids)
            .iter()
            .map(|record| {
                record.immutable(|horse| MountInfoEntry {
                    uid: horse.uid,
                    name: horse.name.clone(),
                    total_distance: horse.total_distance,
                    top_speed: horse.top_speed,
                    speed_wins: horse.speed_wins,
                    magic_wins: horse.magic_wins,
                    best_boost_combo: horse.best_boost_combo,
                })
            })
            .collect();

        let character_uid = command.character_uid;
        self.server.queue_command(client_id, move || AcCmdCLRequestMountInfoOK {
            character_uid,
            mounts,
        });
        Ok(())
    }

    fn handle_set_introduction(
        &self,
        client_id: ClientId,
        command: AcCmdCLSetIntroduction,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let character_record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;
        let introduction = locale::from_wire(&command.introduction);
        character_record.mutable(|character| character.introduction = introduction.clone());

        if let Some(ranch) = self.ranch.get() {
            ranch.broadcast_set_introduction_notify(context.character_uid, introduction);
        }
        Ok(())
    }

    fn handle_goods_shop_list(
        &self,
        client_id: ClientId,
        command: AcCmdCLGoodsShopList,
    ) -> anyhow::Result<()> {
        let _ = self.authenticated(client_id)?;
        self.server.queue_command(client_id, move || AcCmdCLGoodsShopListOK {
            shop_id: command.shop_id,
            goods: Vec::new(),
        });
        Ok(())
    }

    fn handle_update_system_content(
        &self,
        client_id: ClientId,
        command: AcCmdCLUpdateSystemContent,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let character_record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;
        let has_permission =
            character_record.immutable(|character| character.role != CharacterRole::User);
        if !has_permission {
            return Ok(());
        }

        let (clients, system_content) = {
            let mut state = self.state.lock().unwrap();
            match state
                .system_content
                .iter_mut()
                .find(|(key, _)| *key == command.key)
            {
                Some(entry) => entry.1 = command.value,
                None => state.system_content.push((command.key, command.value)),
            }
            (
                state.clients.keys().copied().collect::<Vec<_>>(),
                state.system_content.clone(),
            )
        };

        for client in clients {
            let system_content = SystemContent {
                values: system_content.clone(),
            };
            self.server.queue_command(client, move || AcCmdLCUpdateSystemContent {
                system_content,
            });
        }
        Ok(())
    }

    fn handle_accept_invite_to_guild(
        &self,
        client_id: ClientId,
        command: AcCmdCLAcceptInviteToGuild,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let invited = {
            let mut state = self.state.lock().unwrap();
            match state.guild_invites.get_mut(&command.guild_uid) {
                Some(invitees) => {
                    let was = invitees.contains(&context.character_uid);
                    invitees.retain(|uid| *uid != context.character_uid);
                    was
                }
                None => false,
            }
        };
        if !invited {
            anyhow::bail!(
                "character {} accepted an invite to guild {} that does not exist",
                context.character_uid,
                command.guild_uid
            );
        }

        let guild_record = self
            .ctx
            .data
            .guild(command.guild_uid)
            .ok_or_else(|| anyhow::anyhow!("guild record unavailable"))?;
        guild_record.mutable(|guild| {
            if !guild.members.contains(&context.character_uid) {
                guild.members.push(context.character_uid);
            }
        });

        let character_record = self
            .ctx
            .data
            .character(context.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;
        character_record.mutable(|character| character.guild_uid = command.guild_uid);

        let response = guild_record.immutable(|guild| AcCmdCLAcceptInviteToGuildOK {
            guild: protohelp::build_guild(guild, context.character_uid),
        });
        self.server.queue_command(client_id, move || response);
        Ok(())
    }

    fn handle_decline_invite_to_guild(
        &self,
        client_id: ClientId,
        command: AcCmdCLDeclineInviteToGuild,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(invitees) = state.guild_invites.get_mut(&command.guild_uid) {
            invitees.retain(|uid| *uid != context.character_uid);
        }
        Ok(())
    }

    fn handle_update_user_settings(
        &self,
        client_id: ClientId,
        _command: AcCmdCLUpdateUserSettings,
    ) -> anyhow::Result<()> {
        // Settings are acknowledged implicitly; the record side is opaque
        // to the lobby.
        let _ = self.authenticated(client_id)?;
        Ok(())
    }

    // Operator surface.

    /// Marks a character for forced re-creation at their next login.
    pub fn set_character_forced_into_creator(&self, character_uid: Uid, forced: bool) {
        let mut state = self.state.lock().unwrap();
        if forced {
            state.forced_into_creator.insert(character_uid);
        } else {
            state.forced_into_creator.remove(&character_uid);
        }
    }

    pub fn is_character_forced_into_creator(&self, character_uid: Uid) -> bool {
        self.state
            .lock()
            .unwrap()
            .forced_into_creator
            .contains(&character_uid)
    }

    /// Sets a one-shot rancher preference for the next random ranch visit.
    pub fn set_character_visit_preference(&self, character_uid: Uid, rancher_uid: Uid) {
        let mut state = self.state.lock().unwrap();
        if let Some(context) = state
            .clients
            .values_mut()
            .find(|c| c.character_uid == character_uid && c.is_authenticated)
        {
            context.rancher_visit_preference = rancher_uid;
        }
    }

    pub fn disconnect_character(&self, character_uid: Uid) {
        if let Some(client_id) = self.client_by_character(character_uid) {
            self.server.disconnect_client(client_id);
        }
    }

    /// Pushes a mute notice with the expiry encoded as unix microseconds.
    pub fn mute_character(&self, character_uid: Uid, expires_at_unix: u64) {
        if let Some(client_id) = self.client_by_character(character_uid) {
            self.server.queue_command(client_id, move || AcCmdLCOpMute {
                duration: expires_at_unix * 1_000_000,
            });
        }
    }

    pub fn notify_character(&self, character_uid: Uid, message: String) {
        if let Some(client_id) = self.client_by_character(character_uid) {
            self.server
                .queue_command(client_id, move || AcCmdLCNotice { notice: message });
        }
    }

    /// Registers a guild invite and pushes the invitation to the invitee.
    pub fn invite_character_to_guild(
        &self,
        invitee_uid: Uid,
        guild_uid: Uid,
        inviter_uid: Uid,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state
                .guild_invites
                .entry(guild_uid)
                .or_default()
                .push(invitee_uid);
        }

        let client_id = self
            .client_by_character(invitee_uid)
            .ok_or_else(|| anyhow::anyhow!("invitee is not online"))?;

        let inviter_name = self
            .ctx
            .data
            .character(inviter_uid)
            .map(|record| record.immutable(|c| c.name.clone()))
            .unwrap_or_default();

        let guild_record = self
            .ctx
            .data
            .guild(guild_uid)
            .ok_or_else(|| anyhow::anyhow!("guild record unavailable"))?;
        let command = guild_record.immutable(|guild| AcCmdLCInviteGuildJoin {
            character_uid: invitee_uid,
            inviter_uid,
            inviter_name: inviter_name.clone(),
            guild: protohelp::build_guild(guild, invitee_uid),
            guild_description: guild.description.clone(),
        });

        self.server.queue_command(client_id, move || command);
        Ok(())
    }

    fn client_by_character(&self, character_uid: Uid) -> Option<ClientId> {
        let state = self.state.lock().unwrap();
        state
            .clients
            .iter()
            .find(|(_, c)| c.character_uid == character_uid && c.is_authenticated)
            .map(|(id, _)| *id)
    }

    #[cfg(test)]
    fn queue_lengths(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.login_request_queue.len(),
            state.login_response_queue.len(),
        )
    }

    #[cfg(test)]
    pub fn user_instance(&self, user_name: &str) -> Option<UserInstance> {
        self.state
            .lock()
            .unwrap()
            .user_instances
            .get(user_name)
            .cloned()
    }
}

impl ServerEvents for LobbyDirector {
    fn client_connected(&self, client_id: ClientId) {
        let mut state = self.state.lock().unwrap();
        state.clients.insert(client_id, ClientContext::default());
        state.client_logins.insert(client_id, QueuedLogin::default());
    }

    fn client_disconnected(&self, client_id: ClientId) {
        let mut state = self.state.lock().unwrap();
        state.login_request_queue.retain(|c| *c != client_id);
        state.login_response_queue.retain(|c| *c != client_id);
        state.client_logins.remove(&client_id);

        if let Some(context) = state.clients.remove(&client_id) {
            if context.is_authenticated {
                info!(user = %context.user_name, client = client_id, "user logged out");
                state.user_instances.remove(&context.user_name);
            }
        }
    }
}

fn unix_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn character_mount(
    ctx: &ServerContext,
    character: &crate::records::Character,
) -> canterproto::common::ProtoHorse {
    if character.mount_uid == INVALID_UID {
        return Default::default();
    }
    ctx.data
        .horse(character.mount_uid)
        .map(|record| record.immutable(protohelp::build_horse))
        .unwrap_or_default()
}

fn character_guild(
    ctx: &ServerContext,
    character: &crate::records::Character,
) -> Option<canterproto::common::ProtoGuild> {
    if character.guild_uid == INVALID_UID {
        return None;
    }
    ctx.data
        .guild(character.guild_uid)
        .map(|record| record.immutable(|guild| protohelp::build_guild(guild, character.uid)))
}

fn room_game_mode(mode: rooms::GameMode) -> GameMode {
    match mode {
        rooms::GameMode::Speed => GameMode::Speed,
        rooms::GameMode::Magic => GameMode::Magic,
        rooms::GameMode::Guild => GameMode::Guild,
        rooms::GameMode::Tutorial => GameMode::Tutorial,
    }
}

fn room_team_mode(mode: rooms::TeamMode) -> TeamMode {
    match mode {
        rooms::TeamMode::Solo => TeamMode::Ffa,
        rooms::TeamMode::Team => TeamMode::Team,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{MemoryStore, User};

    fn store_with_user(name: &str, token: &str, character_uid: Uid) -> MemoryStore {
        let store = MemoryStore::default();
        store.users.lock().unwrap().insert(
            name.to_string(),
            User {
                name: name.to_string(),
                token: token.to_string(),
                character_uid,
            },
        );
        if character_uid != INVALID_UID {
            store.characters.lock().unwrap().insert(
                character_uid,
                crate::records::Character {
                    uid: character_uid,
                    name: name.to_string(),
                    gender: 0,
                    level: 60,
                    carrots: 10_000,
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
                },
            );
        }
        store
    }

    fn lobby(store: MemoryStore) -> (Arc<ServerContext>, Arc<LobbyDirector>) {
        let ctx = ServerContext::for_tests(Arc::new(store));
        let server = CommandServer::new("lobby-test");
        let director = LobbyDirector::new(ctx.clone(), server);
        (ctx, director)
    }

    fn login_command(login_id: &str, auth_key: &str) -> AcCmdCLLogin {
        AcCmdCLLogin {
            constant0: PROTOCOL_CONSTANT0,
            constant1: PROTOCOL_CONSTANT1,
            login_id: login_id.to_string(),
            member_no: 1,
            auth_key: auth_key.to_string(),
        }
    }

    async fn settle(director: &Arc<LobbyDirector>, user: &str) {
        for _ in 0..1000 {
            director.tick();
            if director.user_instance(user).is_some() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn login_happy_path() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();

        settle(&director, "alice").await;

        let instance = director.user_instance("alice").expect("logged in");
        assert_eq!(instance.character_uid, 42);
        assert_eq!(director.queue_lengths(), (0, 0));
        assert!(director.state.lock().unwrap().clients[&1].is_authenticated);
    }

    #[tokio::test]
    async fn bad_token_never_admits() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director
            .handle_login(1, login_command("alice", "wrong"))
            .unwrap();

        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }

        assert!(director.user_instance("alice").is_none());
        assert!(!director.state.lock().unwrap().clients[&1].is_authenticated);
        assert_eq!(director.queue_lengths(), (0, 0));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected_before_queueing() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        let mut command = login_command("alice", "T");
        command.constant0 = 49;
        director.handle_login(1, command).unwrap();
        assert_eq!(director.queue_lengths(), (0, 0));
    }

    #[tokio::test]
    async fn duplicate_login_is_cancelled() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        settle(&director, "alice").await;

        // A fresh client under the same name: rejected at the gate because
        // the first session is live.
        director.client_connected(2);
        director.handle_login(2, login_command("alice", "T")).unwrap();
        assert_eq!(director.queue_lengths(), (0, 0));
        assert!(!director.state.lock().unwrap().clients[&2].is_authenticated);
    }

    #[tokio::test]
    async fn banned_user_is_rejected() {
        let store = store_with_user("alice", "T", 42);
        let ctx = ServerContext::for_tests(Arc::new(store));
        ctx.infractions.add(crate::infractions::Punishment {
            user_name: "alice".to_string(),
            kind: crate::infractions::PunishmentKind::Ban,
            expires_at_unix: 0,
            reason: "test".to_string(),
        });
        let server = CommandServer::new("lobby-test");
        let director = LobbyDirector::new(ctx, server);

        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }

        assert!(director.user_instance("alice").is_none());
        assert_eq!(director.queue_lengths(), (0, 0));
    }

    #[tokio::test]
    async fn user_without_character_goes_to_creator() {
        let (_, director) = lobby(store_with_user("fresh", "T", INVALID_UID));
        director.client_connected(1);
        director.handle_login(1, login_command("fresh", "T")).unwrap();

        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }

        // Authenticated, but not yet an instance: admission completes after
        // character creation.
        let state = director.state.lock().unwrap();
        assert!(state.clients[&1].is_authenticated);
        assert!(state.user_instances.is_empty());
        drop(state);

        director
            .handle_create_nickname(
                1,
                AcCmdCLCreateNickname {
                    nickname: "rider99".to_string(),
                    parts: Default::default(),
                    appearance: Default::default(),
                },
            )
            .unwrap();

        let instance = director.user_instance("fresh").expect("admitted");
        assert_ne!(instance.character_uid, INVALID_UID);
    }

    #[tokio::test]
    async fn invalid_nickname_fails_creation() {
        let (_, director) = lobby(store_with_user("fresh", "T", INVALID_UID));
        director.client_connected(1);
        director.handle_login(1, login_command("fresh", "T")).unwrap();
        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }

        director
            .handle_create_nickname(
                1,
                AcCmdCLCreateNickname {
                    nickname: "no spaces!".to_string(),
                    parts: Default::default(),
                    appearance: Default::default(),
                },
            )
            .unwrap();
        assert!(director.user_instance("fresh").is_none());
    }

    #[tokio::test]
    async fn disconnect_mid_queue_cleans_up() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        assert_eq!(director.queue_lengths(), (1, 0));

        director.client_disconnected(1);
        assert_eq!(director.queue_lengths(), (0, 0));

        // The in-flight load completes into the cache with nobody waiting.
        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }
        assert!(director.user_instance("alice").is_none());
    }

    #[tokio::test]
    async fn make_room_then_enter_room_grants_distinct_otps() {
        let (ctx, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        settle(&director, "alice").await;

        director
            .handle_make_room(
                1,
                AcCmdCLMakeRoom {
                    name: "r".to_string(),
                    password: String::new(),
                    player_count: 4,
                    game_mode: GameMode::Speed,
                    team_mode: TeamMode::Ffa,
                    mission_id: 0,
                    npc_race: false,
                    skill_bracket: 0,
                },
            )
            .unwrap();

        // First room gets uid 1 and holds the master's queued seat.
        assert!(ctx.rooms.room_exists(1));
        ctx.rooms
            .get_room(1, |room| {
                assert!(room.queued_players().contains(&42));
                assert_eq!(room.details().course_id, registry::HOT_MAPS_COURSE_ID);
            })
            .unwrap();

        // The room shows up in the matching listing.
        director
            .handle_room_list(
                1,
                AcCmdCLRoomList {
                    page: 0,
                    game_mode: GameMode::Speed,
                    team_mode: TeamMode::Ffa,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn enter_missing_room_is_not_fatal() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        settle(&director, "alice").await;

        director
            .handle_enter_room(
                1,
                AcCmdCLEnterRoom {
                    room_uid: 999,
                    password: String::new(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn login_over_the_wire() {
        use canterio::frame::{FrameReader, FrameWriter};
        use canterproto::{id, wire};

        let ctx = ServerContext::for_tests(Arc::new(store_with_user("alice", "T", 42)));
        let server = CommandServer::new("lobby-wire-test");
        let director = LobbyDirector::new(ctx, server.clone());
        server.set_event_handler(director.clone());
        let addr = server.begin_host("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let ticker = {
            let director = director.clone();
            tokio::spawn(async move {
                loop {
                    director.tick();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (rd, wr) = stream.into_split();
        let mut fw = FrameWriter::new(wr);
        let mut fr = FrameReader::new(rd);

        let payload = {
            let mut out = bytes::BytesMut::new();
            wire::put_u16(&mut out, PROTOCOL_CONSTANT0);
            wire::put_u16(&mut out, PROTOCOL_CONSTANT1);
            wire::put_string(&mut out, "alice");
            wire::put_u32(&mut out, 1);
            wire::put_string(&mut out, "T");
            out.freeze()
        };
        fw.write_frame(id::CL_LOGIN, &payload).await.unwrap();
        fw.flush().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), fr.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.command_id, id::LC_LOGIN_OK);

        // The login payload leads with the character: lobby time, uid, name.
        let mut buf = frame.payload;
        let _lobby_time = wire::get_u64(&mut buf).unwrap();
        assert_eq!(wire::get_u32(&mut buf).unwrap(), 42);
        assert_eq!(wire::get_string(&mut buf).unwrap(), "alice");

        // The operator notice follows.
        let frame = tokio::time::timeout(Duration::from_secs(5), fr.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.command_id, id::LC_NOTICE);
        let mut buf = frame.payload;
        assert!(wire::get_string(&mut buf).unwrap().contains("1 players online"));

        ticker.abort();
        server.end_host();
    }

    #[tokio::test]
    async fn forced_creator_reroutes_login() {
        let (_, director) = lobby(store_with_user("alice", "T", 42));
        director.set_character_forced_into_creator(42, true);

        director.client_connected(1);
        director.handle_login(1, login_command("alice", "T")).unwrap();
        for _ in 0..200 {
            director.tick();
            tokio::task::yield_now().await;
        }

        // Authenticated into the creator: no instance yet, flag consumed.
        let state = director.state.lock().unwrap();
        assert!(state.clients[&1].is_authenticated);
        assert!(state.user_instances.is_empty());
        drop(state);
        assert!(!director.is_character_forced_into_creator(42));
    }
}
