mod common;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use influence_core::{
    start_relay_server, CharacterSheet, ClientId, ClientRole, InMemoryWorld, ItemChange,
    SyncCoordinator, TagState, TcpChannel,
};

fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    bail!("condition not met before deadline")
}

fn world() -> InMemoryWorld {
    let mut world = InMemoryWorld::new();
    world.insert_character(CharacterSheet::npc("boss", "Boss").with_tag("f", "Feared", TagState::Positive));
    world.place_token("hall", "tok-boss", "Boss", "boss", true);
    world.activate_scene("hall");
    world
}

#[test]
fn updates_and_snapshots_cross_the_relay() -> Result<()> {
    let world = world();
    let config = common::test_config();
    let relay = start_relay_server("127.0.0.1:0".parse()?).context("relay failed to bind")?;
    let addr = relay.local_addr();

    let mut gm = SyncCoordinator::new(
        ClientRole::Authority,
        TcpChannel::connect(addr, ClientId::from("gm"))?,
        config.clone(),
    );
    let mut player = SyncCoordinator::new(
        ClientRole::Player,
        TcpChannel::connect(addr, ClientId::from("player-1"))?,
        config.clone(),
    );
    wait_until(|| relay.client_count() == 2)?;

    gm.on_item_changed(&world, &ItemChange::character("boss"));
    assert_eq!(gm.pump(&world, Instant::now()).sent, 1);
    wait_until(|| {
        player.pump(&world, Instant::now());
        player.cache().contains("boss")
    })?;

    let mut late = SyncCoordinator::new(
        ClientRole::Player,
        TcpChannel::connect(addr, ClientId::from("player-2"))?,
        config,
    );
    wait_until(|| relay.client_count() == 3)?;
    late.on_session_joined();
    wait_until(|| {
        let now = Instant::now();
        late.pump(&world, now);
        gm.pump(&world, now);
        player.pump(&world, now);
        !late.awaiting_snapshot()
    })?;

    assert_eq!(late.cache(), gm.cache());
    assert_eq!(player.cache().len(), 1);
    Ok(())
}
