#![allow(non_snake_case)]

use chrono::Utc;
use clicker_sync::{
    SnapshotCache,
    SyncConfig,
    SyncError,
    controller::{
        ActionKind,
        ActionOutcome,
        ActionPhase,
        NoticeLevel,
        SaveStatus,
        SkipReason,
        SnapshotOrigin,
    },
    merge::Field,
    test_helpers::{
        PlayerRecord,
        ServerOp,
        TestContext,
        snapshot_of,
    },
};
use proptest::prelude::*;

async fn bootstrapped(edit: impl FnOnce(&mut PlayerRecord)) -> TestContext {
    let ctx = TestContext::new();
    ctx.server.update_player(&ctx.player, edit);
    ctx.controller.bootstrap().await.unwrap();
    ctx
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn click__awaited_sequence_matches_server_totals(
        clicks in 0usize..40,
        energy in 0u32..=100,
        upgrade_level in 0u32..4,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            // given
            let ctx = bootstrapped(|record| {
                record.energy = energy;
                record.upgrade_level = upgrade_level;
            })
            .await;
            let mut earned = 0u64;

            // when
            for _ in 0..clicks {
                let before = ctx.controller.current_snapshot().unwrap();
                match ctx.controller.click().await.unwrap() {
                    ActionOutcome::Committed => earned += before.points_per_click,
                    ActionOutcome::Skipped(SkipReason::InsufficientEnergy { .. }) => {}
                    other => panic!("unexpected outcome {other:?}"),
                }
            }

            // then
            let view = ctx.controller.current_view().unwrap();
            let record = ctx.server.player(&ctx.player).unwrap();
            let committed = ctx.server.calls(ServerOp::Click) as u32;
            assert_eq!(view.snapshot.points, earned);
            assert_eq!(view.snapshot.points, record.points);
            assert_eq!(view.snapshot.energy, record.energy);
            assert_eq!(view.snapshot.energy, energy - 2 * committed);
            assert_eq!(committed, (clicks as u32).min(energy / 2));
            assert_eq!(view.pending_actions, 0);
        });
    }
}

#[tokio::test]
async fn click__without_enough_energy_sends_nothing() {
    // given
    let ctx = bootstrapped(|record| record.energy = 1).await;
    let calls_before = ctx.server.total_calls();
    let view_before = ctx.controller.current_view();

    // when
    let outcome = ctx.controller.click().await.unwrap();

    // then
    assert_eq!(
        outcome,
        ActionOutcome::Skipped(SkipReason::InsufficientEnergy {
            energy: 1,
            required: 2
        })
    );
    assert_eq!(ctx.server.total_calls(), calls_before);
    assert_eq!(ctx.controller.current_view(), view_before);
}

#[tokio::test]
async fn click__respects_configured_click_cost() {
    // given
    let ctx = TestContext::with_config(SyncConfig::default().with_click_cost(5));
    ctx.server.set_energy(&ctx.player, 4);
    ctx.controller.bootstrap().await.unwrap();

    // when
    let outcome = ctx.controller.click().await.unwrap();

    // then
    assert!(matches!(
        outcome,
        ActionOutcome::Skipped(SkipReason::InsufficientEnergy { required: 5, .. })
    ));
    assert_eq!(ctx.server.calls(ServerOp::Click), 0);
}

#[tokio::test]
async fn click__failure_restores_prior_values_and_notifies() {
    // given
    let mut ctx = bootstrapped(|record| {
        record.points = 10;
        record.energy = 50;
    })
    .await;
    let before = ctx.controller.current_snapshot().unwrap();
    ctx.server
        .fail_next(ServerOp::Click, SyncError::Network("connection reset".into()));

    // when
    let err = ctx.controller.click().await.unwrap_err();

    // then
    assert_eq!(err, SyncError::Network("connection reset".into()));
    assert_eq!(ctx.controller.current_snapshot().unwrap(), before);
    assert_eq!(
        ctx.controller.action_phase(ActionKind::Click),
        ActionPhase::RolledBack
    );
    let notices = ctx.notifications();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].message, "Connection lost, try again");
    assert!(!notices[0].is_expired(Utc::now()));
}

#[tokio::test]
async fn click__server_rejection_surfaces_detail() {
    // given
    let mut ctx = bootstrapped(|record| record.energy = 50).await;
    ctx.server
        .fail_next(ServerOp::Click, SyncError::server(400, "Not enough energy"));

    // when
    let err = ctx.controller.click().await.unwrap_err();

    // then
    assert_eq!(err, SyncError::server(400, "Not enough energy"));
    assert_eq!(ctx.controller.current_snapshot().unwrap().energy, 50);
    assert_eq!(ctx.notifications()[0].message, "Not enough energy");
}

#[tokio::test]
async fn click__sends_a_fresh_idempotency_key_per_request() {
    // given
    let ctx = bootstrapped(|record| record.energy = 10).await;

    // when
    ctx.controller.click().await.unwrap();
    ctx.controller.click().await.unwrap();

    // then
    let tokens = ctx.server.tokens();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
}

#[tokio::test]
async fn click__response_landing_after_a_newer_fetch_is_not_counted_twice() {
    // given
    let ctx = bootstrapped(|record| {
        record.points = 10;
        record.energy = 50;
    })
    .await;
    let gate = ctx.server.hold_next(ServerOp::Click);
    let controller = ctx.controller.clone();
    let click = tokio::spawn(async move { controller.click().await });
    while ctx.server.calls(ServerOp::Click) < 1 {
        tokio::task::yield_now().await;
    }

    // when
    ctx.controller.refresh().await.unwrap();

    // then
    let view = ctx.controller.current_view().unwrap();
    assert_eq!((view.snapshot.points, view.snapshot.energy), (11, 48));
    assert_eq!(view.pending_actions, 1);

    // when
    gate.release();
    let outcome = click.await.unwrap().unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    let record = ctx.server.player(&ctx.player).unwrap();
    assert_eq!((view.snapshot.points, view.snapshot.energy), (11, 48));
    assert_eq!((record.points, record.energy), (11, 48));
    assert_eq!(view.pending_actions, 0);
}

#[tokio::test]
async fn click__during_upgrade_follow_up_fetch_survives_the_older_fetch() {
    // given
    let ctx = bootstrapped(|record| {
        record.points = 1000;
        record.energy = 50;
    })
    .await;
    let gate = ctx.server.hold_next(ServerOp::Fetch);
    let controller = ctx.controller.clone();
    let upgrade = tokio::spawn(async move { controller.upgrade().await });
    while ctx.server.calls(ServerOp::Fetch) < 2 {
        tokio::task::yield_now().await;
    }

    // when
    let clicked = ctx.controller.click().await.unwrap();
    gate.release();
    let upgraded = upgrade.await.unwrap().unwrap();

    // then
    assert_eq!(clicked, ActionOutcome::Committed);
    assert_eq!(upgraded, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    let record = ctx.server.player(&ctx.player).unwrap();
    assert_eq!(view.snapshot.points, 910);
    assert_eq!(view.snapshot.energy, 48);
    assert_eq!((view.snapshot.points, view.snapshot.energy), (record.points, record.energy));
    assert_eq!(view.snapshot.upgrade_level, 1);
    assert_eq!(view.snapshot.next_upgrade_cost, 250);
    assert!(view.stale.is_empty());
    assert_eq!(view.pending_actions, 0);
}

#[tokio::test]
async fn upgrade__wins_over_older_refetch_that_lands_later() {
    // given
    let ctx = bootstrapped(|record| record.points = 1000).await;
    let gate = ctx.server.hold_next(ServerOp::Fetch);
    let controller = ctx.controller.clone();
    let older_refresh = tokio::spawn(async move { controller.refresh().await });
    while ctx.server.calls(ServerOp::Fetch) < 2 {
        tokio::task::yield_now().await;
    }

    // when
    let outcome = ctx.controller.upgrade().await.unwrap();
    gate.release();
    older_refresh.await.unwrap().unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.snapshot.points, 900);
    assert_eq!(view.snapshot.upgrade_level, 1);
    assert_eq!(view.snapshot.next_upgrade_cost, 250);
    assert_eq!(view.snapshot.points_per_click, 10);
    assert!(view.stale.is_empty());
}

#[tokio::test]
async fn upgrade__cost_stays_stale_until_the_follow_up_fetch() {
    // given
    let ctx = bootstrapped(|record| record.points = 1000).await;
    ctx.server
        .fail_next(ServerOp::Fetch, SyncError::Network("timeout".into()));

    // when
    let outcome = ctx.controller.upgrade().await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.stale, vec![Field::NextUpgradeCost]);
    assert_eq!(view.snapshot.points, 900);
    assert_eq!(
        ctx.controller.upgrade().await.unwrap(),
        ActionOutcome::Skipped(SkipReason::UpgradeCostStale)
    );

    // when
    ctx.controller.refresh().await.unwrap();

    // then
    let view = ctx.controller.current_view().unwrap();
    assert!(view.stale.is_empty());
    assert_eq!(view.snapshot.next_upgrade_cost, 250);
}

#[tokio::test]
async fn upgrade__without_enough_points_sends_nothing() {
    // given
    let ctx = bootstrapped(|record| record.points = 99).await;

    // when
    let outcome = ctx.controller.upgrade().await.unwrap();

    // then
    assert_eq!(
        outcome,
        ActionOutcome::Skipped(SkipReason::InsufficientPoints {
            points: 99,
            cost: 100
        })
    );
    assert_eq!(ctx.server.calls(ServerOp::Upgrade), 0);
}

#[tokio::test]
async fn advance__resets_progress_and_raises_tier() {
    // given
    let mut ctx = bootstrapped(|record| {
        record.points = 5000;
        record.upgrade_level = 3;
    })
    .await;
    assert!(ctx.controller.current_snapshot().unwrap().can_advance);

    // when
    let outcome = ctx.controller.advance().await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let snapshot = ctx.controller.current_snapshot().unwrap();
    assert_eq!(snapshot.character_level, 2);
    assert_eq!(snapshot.character_name, "Deishi");
    assert_eq!(snapshot.points, 0);
    assert_eq!(snapshot.upgrade_level, 0);
    assert_eq!(snapshot.max_energy, 150);
    assert_eq!(snapshot.points_per_click, 2);
    assert!(
        ctx.notifications()
            .iter()
            .any(|n| n.message == "Advanced to Deishi!")
    );
}

#[tokio::test]
async fn advance__when_not_eligible_is_a_no_op() {
    // given
    let ctx = bootstrapped(|record| record.points = 4999).await;
    let before = ctx.controller.current_view();

    // when
    let outcome = ctx.controller.advance().await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::CannotAdvance));
    assert_eq!(ctx.server.calls(ServerOp::Advance), 0);
    assert_eq!(ctx.controller.current_view(), before);
}

#[tokio::test]
async fn advance__eligibility_follows_points_an_older_fetch_could_not_overwrite() {
    // given
    let ctx = bootstrapped(|record| record.points = 5050).await;
    assert!(ctx.controller.current_snapshot().unwrap().can_advance);
    let gate = ctx.server.hold_next(ServerOp::Fetch);
    let controller = ctx.controller.clone();
    let older_refresh = tokio::spawn(async move { controller.refresh().await });
    while ctx.server.calls(ServerOp::Fetch) < 2 {
        tokio::task::yield_now().await;
    }
    ctx.server
        .fail_next(ServerOp::Fetch, SyncError::Network("timeout".into()));

    // when
    ctx.controller.upgrade().await.unwrap();
    gate.release();
    older_refresh.await.unwrap().unwrap();

    // then
    let snapshot = ctx.controller.current_snapshot().unwrap();
    assert_eq!(snapshot.points, 4950);
    assert!(!snapshot.can_advance);
    assert_eq!(
        ctx.controller.advance().await.unwrap(),
        ActionOutcome::Skipped(SkipReason::CannotAdvance)
    );
    assert_eq!(ctx.server.calls(ServerOp::Advance), 0);
}

#[tokio::test]
async fn advance__becomes_available_once_a_click_reaches_the_cost() {
    // given
    let ctx = bootstrapped(|record| {
        record.points = 4999;
        record.energy = 10;
    })
    .await;
    assert!(!ctx.controller.current_snapshot().unwrap().can_advance);

    // when
    ctx.controller.click().await.unwrap();

    // then
    assert!(ctx.controller.current_snapshot().unwrap().can_advance);
    assert_eq!(
        ctx.controller.advance().await.unwrap(),
        ActionOutcome::Committed
    );
    assert_eq!(ctx.server.player(&ctx.player).unwrap().character_level, 2);
}

#[tokio::test]
async fn advance__shows_new_tier_as_stale_when_the_follow_up_fetch_fails() {
    // given
    let ctx = bootstrapped(|record| {
        record.points = 5000;
        record.upgrade_level = 3;
    })
    .await;
    ctx.server
        .fail_next(ServerOp::Fetch, SyncError::Network("timeout".into()));

    // when
    let outcome = ctx.controller.advance().await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.snapshot.character_name, "Deishi");
    assert_eq!(view.snapshot.points, 0);
    assert_eq!(view.snapshot.upgrade_level, 0);
    assert!(!view.snapshot.can_advance);
    for field in [Field::Character, Field::Points, Field::UpgradeLevel] {
        assert!(view.stale.contains(&field), "{field:?} should be stale");
    }
    assert_eq!(
        ctx.controller.advance().await.unwrap(),
        ActionOutcome::Skipped(SkipReason::TierStale)
    );
    assert_eq!(ctx.server.calls(ServerOp::Advance), 1);

    // when
    ctx.controller.refresh().await.unwrap();

    // then
    let view = ctx.controller.current_view().unwrap();
    let record = ctx.server.player(&ctx.player).unwrap();
    assert!(view.stale.is_empty());
    assert_eq!(view.snapshot, snapshot_of(&ctx.player, &record));
}

#[tokio::test]
async fn save__reports_status_and_adopts_server_timestamp() {
    // given
    let ctx = bootstrapped(|_| {}).await;
    let status = ctx.controller.subscribe_status();
    ctx.server.advance_clock(chrono::Duration::hours(1));
    let created_at = ctx.server.player(&ctx.player).unwrap().last_save;
    let expected = created_at + chrono::Duration::hours(1);

    // when
    let outcome = ctx.controller.save().await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    assert_eq!(*status.borrow(), SaveStatus::Saved);
    assert_eq!(ctx.controller.current_snapshot().unwrap().saved_at, expected);
}

#[tokio::test]
async fn save__failure_sets_error_status() {
    // given
    let ctx = bootstrapped(|_| {}).await;
    ctx.server
        .fail_next(ServerOp::Save, SyncError::server(500, "disk full"));

    // when
    let err = ctx.controller.save().await.unwrap_err();

    // then
    assert_eq!(err, SyncError::server(500, "disk full"));
    assert_eq!(ctx.controller.save_status(), SaveStatus::Error);
    assert_eq!(
        ctx.controller.action_phase(ActionKind::Save),
        ActionPhase::RolledBack
    );
}

#[tokio::test]
async fn export_then_import__leaves_progress_unchanged() {
    // given
    let ctx = bootstrapped(|record| {
        record.points = 4321;
        record.energy = 40;
        record.character_level = 2;
        record.upgrade_level = 3;
    })
    .await;
    let before = ctx.controller.current_snapshot().unwrap();

    // when
    let exported = ctx.controller.export().await.unwrap();
    let outcome = ctx.controller.import(&exported).await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let after = ctx.controller.current_snapshot().unwrap();
    assert_eq!(
        (after.points, after.energy, after.character_level, after.upgrade_level),
        (before.points, before.energy, before.character_level, before.upgrade_level)
    );
    let record = ctx.server.player(&ctx.player).unwrap();
    assert_eq!(after, snapshot_of(&ctx.player, &record));
}

#[tokio::test]
async fn export__does_not_touch_local_state() {
    // given
    let ctx = bootstrapped(|record| record.points = 12).await;
    let before = ctx.controller.current_view();

    // when
    let text = ctx.controller.export().await.unwrap();

    // then
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["points"], 12);
    assert_eq!(ctx.controller.current_view(), before);
    assert_eq!(ctx.server.calls(ServerOp::Fetch), 1);
}

#[tokio::test]
async fn import__adopts_server_state_and_mirrors_cache() {
    // given
    let ctx = bootstrapped(|record| record.points = 5).await;
    let payload = r#"{"save_data": {"points": 70000, "energy": 120,
        "character_level": 2, "upgrade_level": 4}}"#;

    // when
    let outcome = ctx.controller.import(payload).await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.snapshot.points, 70000);
    assert_eq!(view.snapshot.points_formatted, "70.0K");
    assert_eq!(view.snapshot.energy, 120);
    assert_eq!(view.snapshot.character_name, "Deishi");
    assert_eq!(view.origin, SnapshotOrigin::Server);
    let cached = ctx.cache.get(&ctx.player).unwrap();
    assert_eq!(cached.snapshot, view.snapshot);
}

#[tokio::test]
async fn import__commits_and_marks_everything_stale_when_the_follow_up_fetch_fails() {
    // given
    let ctx = bootstrapped(|record| record.points = 5).await;
    ctx.server
        .fail_next(ServerOp::Fetch, SyncError::Network("offline".into()));
    let payload = r#"{"points": 70000, "energy": 120, "character_level": 2, "upgrade_level": 4}"#;

    // when
    let outcome = ctx.controller.import(payload).await.unwrap();

    // then
    assert_eq!(outcome, ActionOutcome::Committed);
    assert_eq!(
        ctx.controller.action_phase(ActionKind::Import),
        ActionPhase::Committed
    );
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.stale, Field::ALL.to_vec());
    assert_eq!(view.snapshot.points, 5);

    // when
    ctx.controller.refresh().await.unwrap();

    // then
    let view = ctx.controller.current_view().unwrap();
    assert!(view.stale.is_empty());
    assert_eq!(view.snapshot.points, 70000);
    assert_eq!(view.snapshot.character_name, "Deishi");
}

#[tokio::test]
async fn import__rejects_malformed_text_before_sending() {
    // given
    let mut ctx = bootstrapped(|record| record.points = 5).await;
    let before = ctx.controller.current_view();

    // when
    let not_json = ctx.controller.import("{points: 1").await.unwrap_err();
    let bad_level = ctx
        .controller
        .import(r#"{"points": 1, "energy": 1, "character_level": 9, "upgrade_level": 0}"#)
        .await
        .unwrap_err();
    let missing = ctx
        .controller
        .import(r#"{"points": 1, "energy": 1}"#)
        .await
        .unwrap_err();

    // then
    assert!(matches!(not_json, SyncError::Validation(_)));
    assert_eq!(
        bad_level,
        SyncError::Validation("Invalid character level".to_string())
    );
    assert_eq!(
        missing,
        SyncError::Validation(
            r#"Invalid save data: missing fields ["character_level", "upgrade_level"]"#
                .to_string()
        )
    );
    assert_eq!(ctx.server.calls(ServerOp::Import), 0);
    assert_eq!(ctx.controller.current_view(), before);
    assert_eq!(ctx.notifications().len(), 3);
}

#[tokio::test]
async fn bootstrap__shows_cached_snapshot_before_first_fetch_lands() {
    // given
    let ctx = TestContext::new();
    ctx.server.set_points(&ctx.player, 20);
    let mut cached = snapshot_of(&ctx.player, &ctx.server.player(&ctx.player).unwrap());
    cached.set_points(777);
    ctx.cache.put(&ctx.player, &cached);
    let gate = ctx.server.hold_next(ServerOp::Fetch);
    let controller = ctx.controller.clone();
    let bootstrap = tokio::spawn(async move { controller.bootstrap().await });
    while ctx.server.calls(ServerOp::Fetch) < 1 {
        tokio::task::yield_now().await;
    }

    // then
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.origin, SnapshotOrigin::Cache);
    assert_eq!(view.snapshot.points, 777);

    // when
    gate.release();
    bootstrap.await.unwrap().unwrap();

    // then
    let view = ctx.controller.current_view().unwrap();
    assert_eq!(view.origin, SnapshotOrigin::Server);
    assert_eq!(view.snapshot.points, 20);
    assert_eq!(ctx.cache.get(&ctx.player).unwrap().snapshot.points, 20);
}

#[tokio::test]
async fn refresh__failure_keeps_last_committed_snapshot() {
    // given
    let ctx = bootstrapped(|record| record.points = 42).await;
    ctx.server
        .fail_next(ServerOp::Fetch, SyncError::Network("offline".into()));

    // when
    let err = ctx.controller.refresh().await.unwrap_err();

    // then
    assert_eq!(err, SyncError::Network("offline".into()));
    assert_eq!(ctx.controller.current_snapshot().unwrap().points, 42);
}

#[tokio::test]
async fn subscribe__publishes_every_committed_change() {
    // given
    let ctx = bootstrapped(|record| record.energy = 10).await;
    let mut views = ctx.controller.subscribe();
    views.borrow_and_update();

    // when
    ctx.controller.click().await.unwrap();

    // then
    assert!(views.has_changed().unwrap());
    let view = views.borrow_and_update().clone().unwrap();
    assert_eq!(view.snapshot.points, 1);
    assert_eq!(view.snapshot.energy, 8);
}
