//! Drift correction and follower re-attachment tests

mod helpers;

use helpers::{advance_ms, assert_close, TestPlayer, INSTRUMENTAL, VOCALS};
use kara_sync::media::sim::SimMedia;
use kara_sync::playback::{SyncAction, SyncMeasurement};
use kara_sync::Location;

fn drift_of(action: SyncAction) -> f64 {
    match action {
        SyncAction::InSync(SyncMeasurement { drift }) | SyncAction::Corrected(SyncMeasurement { drift }) => drift,
        other => panic!("expected a measurement, got {:?}", other),
    }
}

/// **Given:** The follower 0.15s ahead of the primary
/// **When:** The drift corrector ticks
/// **Then:** The follower is moved to primary + 0.01
#[tokio::test(start_paused = true)]
async fn test_large_drift_corrected_with_bias() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;
    player.primary().force_position(50.0);
    player.follower().force_position(50.15);

    let action = player.engine.sync_tick().await;

    assert!(matches!(action, SyncAction::Corrected(_)));
    assert!((drift_of(action) - 0.15).abs() < 1e-9);
    assert_close(player.follower().position(), 50.01);
    assert_close(player.primary().position(), 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_corrected() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;
    player.primary().force_position(50.0);
    player.follower().force_position(49.8);

    let action = player.engine.sync_tick().await;

    assert!(matches!(action, SyncAction::Corrected(_)));
    assert!(drift_of(action) < 0.0);
    assert_close(player.follower().position(), 50.01);
}

/// **Given:** The follower 0.05s ahead of the primary
/// **When:** The drift corrector ticks
/// **Then:** The follower is left alone
#[tokio::test(start_paused = true)]
async fn test_small_drift_untouched() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;
    player.primary().force_position(50.0);
    player.follower().force_position(50.05);

    let action = player.engine.sync_tick().await;

    assert!(matches!(action, SyncAction::InSync(_)));
    assert_close(player.follower().position(), 50.05);
}

/// **Given:** A seek that has not settled yet
/// **When:** The drift corrector ticks with a diverged follower
/// **Then:** The follower is not touched until the settle task re-checks it
#[tokio::test(start_paused = true)]
async fn test_settle_window_suppresses_correction() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;

    player.engine.seek(30.0).await;
    player.follower().force_position(30.5);

    assert_eq!(player.engine.sync_tick().await, SyncAction::Settling);
    assert_close(player.follower().position(), 30.5);

    advance_ms(130).await;

    assert!(!player.engine.is_settling());
    let drift = player.follower().position() - player.primary().position();
    assert!(drift.abs() < 0.09, "follower still {} off after settling", drift);
}

#[tokio::test(start_paused = true)]
async fn test_idle_when_paused_or_primary_only() {
    let player = TestPlayer::with_song(180.0);
    player.load_song().await;
    assert_eq!(player.engine.sync_tick().await, SyncAction::Idle);

    player.engine.load_track(INSTRUMENTAL, None).await.unwrap();
    player.engine.play().await.unwrap();
    assert_eq!(player.engine.sync_tick().await, SyncAction::Idle);
}

/// **Given:** A follower that silently stopped while the primary plays
/// **When:** The drift corrector ticks
/// **Then:** The follower is re-aligned and started again
#[tokio::test(start_paused = true)]
async fn test_stalled_follower_reattached() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;
    advance_ms(1000).await;

    player.follower().stall();
    assert!(player.follower().is_paused());

    assert_eq!(player.engine.sync_tick().await, SyncAction::Reattached(true));
    assert!(!player.follower().is_paused());
    assert_close(player.follower().position(), player.primary().position());
}

/// **Given:** A follower that could not be started by play()
/// **When:** The drift corrector ticks once the follower accepts starts again
/// **Then:** It is re-attached
#[tokio::test(start_paused = true)]
async fn test_follower_recovered_after_failed_start() {
    let player = TestPlayer::new();
    player.register(INSTRUMENTAL, SimMedia::new(180.0));
    player.register(VOCALS, SimMedia::new(180.0).with_play_failures(5));
    player
        .engine
        .load_track(INSTRUMENTAL, Some(Location::from(VOCALS)))
        .await
        .unwrap();
    player.engine.play().await.unwrap();
    assert!(player.follower().is_paused());

    player.follower().fail_next_plays(1);
    assert_eq!(player.engine.sync_tick().await, SyncAction::Reattached(false));
    assert!(player.follower().is_paused());

    assert_eq!(player.engine.sync_tick().await, SyncAction::Reattached(true));
    assert!(!player.follower().is_paused());
}

/// **Given:** A stalled follower and the periodic corrector running
/// **When:** Time passes
/// **Then:** The follower resumes without any direct call
#[tokio::test(start_paused = true)]
async fn test_periodic_corrector_recovers_stall() {
    let player = TestPlayer::with_song(180.0);
    player.play_song().await;
    advance_ms(500).await;

    player.follower().stall();
    advance_ms(450).await;

    assert!(!player.follower().is_paused());
    let drift = player.follower().position() - player.primary().position();
    assert!(drift.abs() < 0.09);
}

#[tokio::test(start_paused = true)]
async fn test_follower_at_its_end_not_reattached() {
    let player = TestPlayer::new();
    player.register(INSTRUMENTAL, SimMedia::new(180.0));
    player.register(VOCALS, SimMedia::new(30.0));
    player
        .engine
        .load_track(INSTRUMENTAL, Some(Location::from(VOCALS)))
        .await
        .unwrap();
    player.engine.play().await.unwrap();

    player.primary().force_position(30.5);
    player.follower().force_position(30.0);
    assert!(player.follower().is_paused());

    // Ended followers are measured, not restarted
    assert!(!matches!(player.engine.sync_tick().await, SyncAction::Reattached(_)));
}
