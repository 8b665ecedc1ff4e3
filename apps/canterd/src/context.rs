use std::sync::Arc;

use crate::chat::ChatSystem;
use crate::config::Config;
use crate::infractions::InfractionSystem;
use crate::otp::OtpSystem;
use crate::records::DataDirector;
use crate::registry::CourseRegistry;
use crate::rooms::RoomSystem;

/// Process-wide collaborators shared by the three directors.
///
/// Everything here is its own synchronization domain; directors hold the
/// context by `Arc` and never reach into each other's state through it.
pub struct ServerContext {
    pub config: Config,
    pub data: Arc<DataDirector>,
    pub rooms: RoomSystem,
    pub otp: OtpSystem,
    pub registry: CourseRegistry,
    pub infractions: InfractionSystem,
    pub chat: ChatSystem,
}

impl ServerContext {
    pub fn new(
        config: Config,
        data: Arc<DataDirector>,
        registry: CourseRegistry,
        infractions: InfractionSystem,
    ) -> Arc<Self> {
        let chat = ChatSystem::new(config.blocked_words.clone());
        Arc::new(Self {
            config,
            data,
            rooms: RoomSystem::new(),
            otp: OtpSystem::new(),
            registry,
            infractions,
            chat,
        })
    }

    /// Test wiring: defaults everywhere, records from the given store.
    #[cfg(test)]
    pub fn for_tests(store: Arc<dyn crate::records::RecordStore>) -> Arc<Self> {
        Self::new(
            Config::default(),
            DataDirector::new(store),
            CourseRegistry::load_embedded().expect("embedded registry"),
            InfractionSystem::new(),
        )
    }
}
