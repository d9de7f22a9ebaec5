#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use influence_core::{
    load_sync_config_from_env, ClientId, ClientRole, LocalBus, LocalEndpoint, SyncConfig,
    SyncCoordinator, SYNC_CONFIG_PATH_ENV,
};

static INIT: Once = Once::new();

pub type Client = SyncCoordinator<LocalEndpoint>;

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_sync_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test sync config at {}",
            config_path.display()
        );

        std::env::set_var(SYNC_CONFIG_PATH_ENV, &config_path);
    });
}

pub fn test_config() -> Arc<SyncConfig> {
    ensure_test_config();
    let (config, path) = load_sync_config_from_env();
    debug_assert!(path.is_some(), "test sync config was not picked up");
    config
}

/// One GM and any number of players sharing an in-process bus.
pub struct Session {
    pub bus: LocalBus,
    pub config: Arc<SyncConfig>,
    pub gm: Client,
    pub players: Vec<Client>,
    pub now: Instant,
}

impl Session {
    pub fn new(players: usize) -> Self {
        Self::with_config(players, test_config())
    }

    pub fn with_config(players: usize, config: Arc<SyncConfig>) -> Self {
        let bus = LocalBus::new();
        let gm = SyncCoordinator::new(
            ClientRole::Authority,
            bus.connect(ClientId::from("gm")),
            Arc::clone(&config),
        );
        let mut session = Self {
            bus,
            config,
            gm,
            players: Vec::new(),
            now: Instant::now(),
        };
        for _ in 0..players {
            session.join_player();
        }
        session
    }

    /// Connects a new player who immediately asks for a snapshot.
    pub fn join_player(&mut self) -> usize {
        let id = ClientId::new(format!("player-{}", self.players.len() + 1));
        let mut player = SyncCoordinator::new(
            ClientRole::Player,
            self.bus.connect(id),
            Arc::clone(&self.config),
        );
        player.on_session_joined();
        self.players.push(player);
        self.players.len() - 1
    }

    pub fn player(&self, index: usize) -> &Client {
        &self.players[index]
    }

    pub fn player_mut(&mut self, index: usize) -> &mut Client {
        &mut self.players[index]
    }

    /// Pumps every client until nobody sends or receives anything.
    pub fn settle(&mut self, world: &dyn influence_core::WorldView) -> usize {
        let mut rounds = 0;
        for _ in 0..64 {
            rounds += 1;
            let mut activity = 0;
            let report = self.gm.pump(world, self.now);
            activity += report.received + report.sent;
            for player in &mut self.players {
                let report = player.pump(world, self.now);
                activity += report.received + report.sent;
            }
            if activity == 0 {
                break;
            }
        }
        rounds
    }

    /// Moves the clock forward `step` at a time, settling after each step.
    pub fn advance(&mut self, world: &dyn influence_core::WorldView, step: Duration, steps: u32) {
        for _ in 0..steps {
            self.now += step;
            self.settle(world);
        }
    }
}
