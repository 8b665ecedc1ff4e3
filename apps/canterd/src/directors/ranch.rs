use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use canterproto::common::{Uid, INVALID_UID};
use canterproto::ranch::*;
use tracing::info;

use crate::context::ServerContext;
use crate::net::{ClientId, CommandServer, ServerEvents};
use crate::otp;
use crate::protohelp;

#[derive(Debug, Clone, Copy, Default)]
struct ClientContext {
    character_uid: Uid,
    rancher_uid: Uid,
    is_authenticated: bool,
}

#[derive(Default)]
struct RanchState {
    clients: HashMap<ClientId, ClientContext>,
    /// Residents per ranch, keyed by the rancher's character uid.
    ranches: HashMap<Uid, HashSet<ClientId>>,
}

/// The ranch endpoint: persistent social spaces.
///
/// Admission is by lobby-granted OTP; after that the surface is a roster
/// snapshot, join/leave notifies, chat, and slow position updates.
pub struct RanchDirector {
    ctx: Arc<ServerContext>,
    server: Arc<CommandServer>,
    weak: std::sync::Weak<Self>,
    state: Mutex<RanchState>,
}

impl RanchDirector {
    pub fn new(ctx: Arc<ServerContext>, server: Arc<CommandServer>) -> Arc<Self> {
        let director = Arc::new_cyclic(|weak| Self {
            ctx,
            server,
            weak: weak.clone(),
            state: Mutex::new(RanchState::default()),
        });

        director.register_handlers();
        director
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("ranch director alive")
    }

    fn register_handlers(&self) {
        let d = self.arc();
        self.server
            .register_command_handler::<AcCmdCREnterRanch>(move |client, command| {
                d.handle_enter_ranch(client, command)
            });

        let d = self.arc();
        self.server
            .register_command_handler::<AcCmdCRLeaveRanch>(move |client, _| {
                d.handle_leave_ranch(client);
                Ok(())
            });

        let d = self.arc();
        self.server
            .register_command_handler::<AcCmdCRRanchChat>(move |client, command| {
                d.handle_chat(client, command)
            });

        let d = self.arc();
        self.server
            .register_command_handler::<AcCmdCRRanchSnapshot>(move |client, command| {
                d.handle_snapshot(client, command)
            });
    }

    fn authenticated(&self, client_id: ClientId) -> anyhow::Result<ClientContext> {
        let state = self.state.lock().unwrap();
        let context = state
            .clients
            .get(&client_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("ranch client {client_id} is not available"))?;
        if !context.is_authenticated {
            anyhow::bail!("ranch client {client_id} is not authenticated");
        }
        Ok(context)
    }

    fn residents_of(&self, rancher_uid: Uid) -> Vec<ClientId> {
        let state = self.state.lock().unwrap();
        state
            .ranches
            .get(&rancher_uid)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    fn handle_enter_ranch(
        &self,
        client_id: ClientId,
        command: AcCmdCREnterRanch,
    ) -> anyhow::Result<()> {
        let authorized = self.ctx.otp.authorize_code(
            otp::identity_hash(&[command.character_uid]),
            command.one_time_password,
        );

        // A locked ranch only admits its owner.
        let rancher_record = self.ctx.data.character(command.rancher_uid);
        let is_locked = rancher_record
            .as_ref()
            .map(|record| record.immutable(|rancher| rancher.is_ranch_locked))
            .unwrap_or(true);
        let entering_own = command.rancher_uid == command.character_uid;

        if !authorized || rancher_record.is_none() || (is_locked && !entering_own) {
            self.server
                .queue_command(client_id, || AcCmdCREnterRanchCancel);
            return Ok(());
        }

        let resident = self
            .build_resident(command.character_uid)
            .ok_or_else(|| anyhow::anyhow!("character record unavailable"))?;

        let ranch_name = rancher_record
            .expect("checked above")
            .immutable(|rancher| format!("{}'s ranch", rancher.name));

        let residents: Vec<RanchResident> = {
            let state = self.state.lock().unwrap();
            state
                .ranches
                .get(&command.rancher_uid)
                .into_iter()
                .flatten()
                .filter_map(|other| {
                    let other = state.clients.get(other)?;
                    self.build_resident(other.character_uid)
                })
                .collect()
        };

        let others = self.residents_of(command.rancher_uid);

        {
            let mut state = self.state.lock().unwrap();
            state.clients.insert(
                client_id,
                ClientContext {
                    character_uid: command.character_uid,
                    rancher_uid: command.rancher_uid,
                    is_authenticated: true,
                },
            );
            state
                .ranches
                .entry(command.rancher_uid)
                .or_default()
                .insert(client_id);
        }

        info!(
            character = command.character_uid,
            rancher = command.rancher_uid,
            "character entered ranch"
        );

        let rancher_uid = command.rancher_uid;
        self.server.queue_command(client_id, move || AcCmdCREnterRanchOK {
            rancher_uid,
            ranch_name,
            residents,
        });

        for other in others {
            let resident = resident.clone();
            self.server
                .queue_command(other, move || AcCmdCREnterRanchNotify { resident });
        }

        Ok(())
    }

    fn build_resident(&self, character_uid: Uid) -> Option<RanchResident> {
        let record = self.ctx.data.character(character_uid)?;
        Some(record.immutable(|character| RanchResident {
            uid: character.uid,
            name: character.name.clone(),
            introduction: character.introduction.clone(),
            avatar: protohelp::build_avatar(&self.ctx.data, character),
        }))
    }

    fn handle_leave_ranch(&self, client_id: ClientId) {
        let Some(context) = self.remove_resident(client_id) else {
            return;
        };

        self.server.queue_command(client_id, || AcCmdCRLeaveRanchOK);

        let character_uid = context.character_uid;
        for other in self.residents_of(context.rancher_uid) {
            self.server
                .queue_command(other, move || AcCmdCRLeaveRanchNotify { character_uid });
        }
    }

    fn remove_resident(&self, client_id: ClientId) -> Option<ClientContext> {
        let mut state = self.state.lock().unwrap();
        let context = state.clients.remove(&client_id)?;
        if let Some(residents) = state.ranches.get_mut(&context.rancher_uid) {
            residents.remove(&client_id);
            if residents.is_empty() {
                state.ranches.remove(&context.rancher_uid);
            }
        }
        Some(context)
    }

    fn handle_chat(&self, client_id: ClientId, command: AcCmdCRRanchChat) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let author = self
            .ctx
            .data
            .character(context.character_uid)
            .map(|record| record.immutable(|c| c.name.clone()))
            .unwrap_or_default();

        let verdict = self
            .ctx
            .chat
            .process_message(&self.ctx.infractions, &author, &command.message);
        if verdict.suppress {
            return Ok(());
        }

        for resident in self.residents_of(context.rancher_uid) {
            let author = author.clone();
            let message = verdict.message.clone();
            self.server.queue_command(resident, move || AcCmdCRRanchChatNotify {
                author,
                message,
                is_system: false,
            });
        }
        Ok(())
    }

    fn handle_snapshot(
        &self,
        client_id: ClientId,
        command: AcCmdCRRanchSnapshot,
    ) -> anyhow::Result<()> {
        let context = self.authenticated(client_id)?;

        let character_uid = context.character_uid;
        for other in self.residents_of(context.rancher_uid) {
            if other == client_id {
                continue;
            }
            self.server.queue_command(other, move || AcCmdRCRanchSnapshotNotify {
                character_uid,
                position: command.position,
                heading: command.heading,
            });
        }
        Ok(())
    }

    /// Pushes an introduction change to everyone sharing a ranch with the
    /// character. Called from the lobby on `SetIntroduction`.
    pub fn broadcast_set_introduction_notify(&self, character_uid: Uid, introduction: String) {
        let rancher_uid = {
            let state = self.state.lock().unwrap();
            state
                .clients
                .values()
                .find(|c| c.character_uid == character_uid && c.is_authenticated)
                .map(|c| c.rancher_uid)
                .unwrap_or(INVALID_UID)
        };
        if rancher_uid == INVALID_UID {
            return;
        }

        for resident in self.residents_of(rancher_uid) {
            let introduction = introduction.clone();
            self.server.queue_command(resident, move || AcCmdRCSetIntroductionNotify {
                character_uid,
                introduction,
            });
        }
    }
}

impl ServerEvents for RanchDirector {
    fn client_connected(&self, client_id: ClientId) {
        self.state
            .lock()
            .unwrap()
            .clients
            .insert(client_id, ClientContext::default());
    }

    fn client_disconnected(&self, client_id: ClientId) {
        let context = self.remove_resident(client_id);
        if let Some(context) = context {
            if context.is_authenticated {
                let character_uid = context.character_uid;
                for other in self.residents_of(context.rancher_uid) {
                    self.server
                        .queue_command(other, move || AcCmdCRLeaveRanchNotify { character_uid });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Character, MemoryStore};

    fn character(uid: Uid, name: &str, locked: bool) -> Character {
        Character {
            uid,
            name: name.to_string(),
            gender: 0,
            level: 10,
            carrots: 0,
            cash: 0,
            role: Default::default(),
            introduction: String::new(),
            mount_uid: 0,
            horses: vec![],
            inventory: vec![],
            character_equipment: vec![],
            mount_equipment: vec![],
            settings_uid: 0,
            guild_uid: 0,
            pet_uid: 0,
            is_ranch_locked: locked,
            parts: Default::default(),
            appearance: Default::default(),
            skills: Default::default(),
        }
    }

    fn seeded() -> (Arc<ServerContext>, Arc<RanchDirector>) {
        let ctx = ServerContext::for_tests(Arc::new(MemoryStore::default()));
        // Records normally arrive via the lobby login pipeline; tests seed
        // the cache directly.
        ctx.data.characters.insert(1, character(1, "alice", false));
        ctx.data.characters.insert(2, character(2, "bob", true));

        let server = CommandServer::new("ranch-test");
        let director = RanchDirector::new(ctx.clone(), server);
        (ctx, director)
    }

    fn enter(character_uid: Uid, code: u32, rancher_uid: Uid) -> AcCmdCREnterRanch {
        AcCmdCREnterRanch {
            character_uid,
            one_time_password: code,
            rancher_uid,
        }
    }

    // Handlers are exercised directly; replies queued to clients without a
    // socket are dropped by the command server.
    #[tokio::test]
    async fn otp_gates_entry() {
        let (ctx, director) = seeded();
        director.client_connected(7);

        let code = ctx.otp.grant_code(otp::identity_hash(&[1]));
        director
            .handle_enter_ranch(7, enter(1, code.wrapping_add(1), 1))
            .unwrap();
        assert!(!director.state.lock().unwrap().clients[&7].is_authenticated);

        director.handle_enter_ranch(7, enter(1, code, 1)).unwrap();
        let state = director.state.lock().unwrap();
        assert!(state.clients[&7].is_authenticated);
        assert!(state.ranches[&1].contains(&7));
    }

    #[tokio::test]
    async fn locked_ranch_admits_only_its_owner() {
        let (ctx, director) = seeded();
        director.client_connected(7);

        // Alice cannot enter Bob's locked ranch even with a valid code.
        let code = ctx.otp.grant_code(otp::identity_hash(&[1]));
        director.handle_enter_ranch(7, enter(1, code, 2)).unwrap();
        assert!(!director.state.lock().unwrap().clients[&7].is_authenticated);

        // Bob enters his own locked ranch.
        director.client_connected(8);
        let code = ctx.otp.grant_code(otp::identity_hash(&[2]));
        director.handle_enter_ranch(8, enter(2, code, 2)).unwrap();
        assert!(director.state.lock().unwrap().clients[&8].is_authenticated);
    }

    #[tokio::test]
    async fn disconnect_removes_resident() {
        let (ctx, director) = seeded();
        director.client_connected(7);
        let code = ctx.otp.grant_code(otp::identity_hash(&[1]));
        director.handle_enter_ranch(7, enter(1, code, 1)).unwrap();

        director.client_disconnected(7);
        let state = director.state.lock().unwrap();
        assert!(!state.clients.contains_key(&7));
        assert!(!state.ranches.contains_key(&1));
    }
}
