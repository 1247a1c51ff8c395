//! Lifecycle engine integration tests
//!
//! Exercises the delegation state machine and the escrow transfers against a
//! real (in-memory) store.

use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use weituo::error::AppError;
use weituo::lifecycle::{LifecycleEngine, LifecycleError};
use weituo::models::{
    AnswerOption, CreateDelegationRequest, DelegationState, Question, QuestionnaireDefinition,
    QuestionnaireRecord, User,
};
use weituo::store::Store;

async fn setup_with_grace(grace: Duration) -> (Store, LifecycleEngine) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = Store::new(pool);
    let engine = LifecycleEngine::new(store.clone(), grace);
    (store, engine)
}

/// Grace long enough that the confirmation timer never fires mid-test
async fn setup() -> (Store, LifecycleEngine) {
    setup_with_grace(Duration::from_secs(30)).await
}

/// Multi-connection pool over a shared in-memory database, so concurrent
/// operations really run on separate connections as they do in production
async fn racing_setup() -> (Store, LifecycleEngine) {
    let url = format!(
        "sqlite:file:race_{}?mode=memory&cache=shared",
        Uuid::new_v4().simple()
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to create shared in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = Store::new(pool);
    let engine = LifecycleEngine::new(store.clone(), Duration::from_secs(30));
    (store, engine)
}

async fn add_user(store: &Store, open_id: &str, credit: i64) {
    store
        .create_user(&User {
            open_id: open_id.to_string(),
            name: open_id.to_string(),
            student_number: format!("sn-{}", open_id),
            credit,
        })
        .await
        .unwrap();
}

async fn credit_of(store: &Store, open_id: &str) -> i64 {
    store.get_user(open_id).await.unwrap().unwrap().credit
}

fn request(reward: i64, max_number: i64) -> CreateDelegationRequest {
    CreateDelegationRequest {
        name: "buy breakfast".to_string(),
        description: "one steamed bun from the east canteen".to_string(),
        reward,
        deadline: Utc::now().timestamp() + 3600,
        delegation_type: "common".to_string(),
        max_number,
        questionnaire: None,
    }
}

fn assert_rule(err: AppError, expected: LifecycleError) {
    match err {
        AppError::Rule(e) => assert_eq!(e, expected),
        other => panic!("expected rule error {:?}, got {:?}", expected, other),
    }
}

// Creation

#[tokio::test]
async fn scenario_a_create_escrows_reward_times_capacity() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();

    assert_eq!(credit_of(&store, "alice").await, 80);
    assert_eq!(delegation.state, DelegationState::Published);
    assert_eq!(delegation.current_number, 0);
    assert_eq!(delegation.max_number, 1);
}

#[tokio::test]
async fn create_rejects_insufficient_credit_without_mutation() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 30).await;

    let err = engine.create("alice", &request(20, 2)).await.unwrap_err();
    assert_rule(err, LifecycleError::InsufficientCredit);

    assert_eq!(credit_of(&store, "alice").await, 30);
    let (_, total) = store.list_by_publisher("alice", 1, 10).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn create_rejects_invalid_capacity() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let err = engine.create("alice", &request(20, 0)).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn create_rejects_overflowing_escrow() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let err = engine
        .create("alice", &request(i64::MAX, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    assert_eq!(credit_of(&store, "alice").await, 100);

    let err = engine
        .create("alice", &request(2, i64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    assert_eq!(credit_of(&store, "alice").await, 100);
}

#[tokio::test]
async fn create_unknown_publisher() {
    let (_store, engine) = setup().await;
    let err = engine.create("ghost", &request(10, 1)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn create_questionnaire_type_requires_definition() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let mut req = request(10, 1);
    req.delegation_type = "questionnaire".to_string();
    let err = engine.create("alice", &req).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    req.questionnaire = Some(QuestionnaireDefinition {
        title: "canteen survey".to_string(),
        questions: vec![Question {
            topic: "favourite canteen?".to_string(),
            answers: vec![
                AnswerOption {
                    option: "east".to_string(),
                    count: 0,
                },
                AnswerOption {
                    option: "west".to_string(),
                    count: 0,
                },
            ],
        }],
    });
    let delegation = engine.create("alice", &req).await.unwrap();
    assert!(delegation.questionnaire_id.is_some());
}

// Receiving

#[tokio::test]
async fn scenario_b_receive_escrows_and_fills_capacity() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    let updated = engine.receive("bob", &delegation.id).await.unwrap();

    assert_eq!(credit_of(&store, "bob").await, 30);
    assert_eq!(updated.state, DelegationState::Accepted);
    assert_eq!(updated.current_number, 1);
    assert_eq!(updated.receivers, vec!["bob".to_string()]);
}

#[tokio::test]
async fn receive_rejects_publisher() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    let err = engine.receive("alice", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::SelfReceiveForbidden);
}

#[tokio::test]
async fn receive_rejects_double_receive() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 100).await;

    let delegation = engine.create("alice", &request(20, 2)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let err = engine.receive("bob", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::AlreadyReceived);
    // Only the first escrow was taken
    assert_eq!(credit_of(&store, "bob").await, 80);
}

#[tokio::test]
async fn receive_rejects_when_capacity_full() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "carol", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let err = engine.receive("carol", &delegation.id).await.unwrap_err();
    match err {
        AppError::Rule(e) => assert_eq!(e.class(), 402),
        other => panic!("expected rule error, got {:?}", other),
    }
    assert_eq!(credit_of(&store, "carol").await, 50);
}

#[tokio::test]
async fn receive_rejects_expired_deadline() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let mut req = request(20, 1);
    req.deadline = Utc::now().timestamp() - 1;
    let delegation = engine.create("alice", &req).await.unwrap();

    let err = engine.receive("bob", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::Expired);
}

#[tokio::test]
async fn receive_rejects_insufficient_credit() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 5).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    let err = engine.receive("bob", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::InsufficientCredit);
    assert_eq!(credit_of(&store, "bob").await, 5);
}

#[tokio::test]
async fn last_slot_admits_exactly_one_of_two_racers() {
    let (store, engine) = racing_setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "carol", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();

    let (first, second) = tokio::join!(
        engine.receive("bob", &delegation.id),
        engine.receive("carol", &delegation.id),
    );
    let successes = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1);

    // The loser gets a rule rejection, not a storage error
    let err = first.err().or(second.err()).unwrap();
    match err {
        AppError::Rule(e) => assert_eq!(e.class(), 402),
        other => panic!("expected a rule rejection, got {:?}", other),
    }

    let updated = store.get_delegation(&delegation.id).await.unwrap();
    assert_eq!(updated.current_number, 1);
    assert_eq!(updated.max_number, 1);
    assert_eq!(updated.state, DelegationState::Accepted);
    // Exactly one escrow was taken
    let total = credit_of(&store, "bob").await + credit_of(&store, "carol").await;
    assert_eq!(total, 80);
}

// Finishing, single receiver

#[tokio::test]
async fn scenario_c_report_then_publisher_confirm() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let pending = engine.finish("bob", &delegation.id).await.unwrap();
    assert_eq!(pending.state, DelegationState::Pending);
    assert!(engine.scheduler().is_armed(&delegation.id).await);

    let finished = engine.finish("alice", &delegation.id).await.unwrap();
    assert_eq!(finished.state, DelegationState::Finished);
    assert_eq!(credit_of(&store, "bob").await, 70);
    assert_eq!(credit_of(&store, "alice").await, 80);
    assert!(!engine.scheduler().is_armed(&delegation.id).await);
}

#[tokio::test]
async fn publisher_cannot_confirm_before_receiver_reports() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let err = engine.finish("alice", &delegation.id).await.unwrap_err();
    assert_rule(
        err,
        LifecycleError::InvalidState {
            operation: "finish",
            state: "accepted",
        },
    );
}

#[tokio::test]
async fn finish_is_idempotent_after_settlement() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    engine.finish("bob", &delegation.id).await.unwrap();
    engine.finish("alice", &delegation.id).await.unwrap();

    let err = engine.finish("alice", &delegation.id).await.unwrap_err();
    assert_rule(
        err,
        LifecycleError::InvalidState {
            operation: "finish",
            state: "finished",
        },
    );
    // No further credit moved
    assert_eq!(credit_of(&store, "bob").await, 70);
    assert_eq!(credit_of(&store, "alice").await, 80);
}

#[tokio::test]
async fn stranger_cannot_finish() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "mallory", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let err = engine.finish("mallory", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::Unauthorized);
}

// Deferred confirmation

#[tokio::test]
async fn auto_confirm_pays_out_after_grace_window() {
    let (store, engine) = setup_with_grace(Duration::from_millis(100)).await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    engine.finish("bob", &delegation.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let settled = store.get_delegation(&delegation.id).await.unwrap();
    assert_eq!(settled.state, DelegationState::Finished);
    assert_eq!(credit_of(&store, "bob").await, 70);

    // A late publisher confirm is rejected and pays nothing further
    let err = engine.finish("alice", &delegation.id).await.unwrap_err();
    assert_rule(
        err,
        LifecycleError::InvalidState {
            operation: "finish",
            state: "finished",
        },
    );
    assert_eq!(credit_of(&store, "bob").await, 70);
}

#[tokio::test]
async fn early_publisher_confirm_disarms_the_timer() {
    let (store, engine) = setup_with_grace(Duration::from_millis(200)).await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    engine.finish("bob", &delegation.id).await.unwrap();
    engine.finish("alice", &delegation.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The cancelled timer must not have paid a second time
    assert_eq!(credit_of(&store, "bob").await, 70);
    let settled = store.get_delegation(&delegation.id).await.unwrap();
    assert_eq!(settled.state, DelegationState::Finished);
}

// Cancellation

#[tokio::test]
async fn scenario_d_publisher_cancel_without_receivers_refunds_escrow() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let delegation = engine.create("alice", &request(20, 2)).await.unwrap();
    assert_eq!(credit_of(&store, "alice").await, 60);

    let canceled = engine.cancel("alice", &delegation.id).await.unwrap();
    assert_eq!(canceled.state, DelegationState::Canceled);
    assert_eq!(credit_of(&store, "alice").await, 100);
}

#[tokio::test]
async fn scenario_e_receiver_self_cancel_forfeits_escrow() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let updated = engine.cancel("bob", &delegation.id).await.unwrap();
    // Forfeit stays lost for bob, publisher gets the slot escrow plus the forfeit
    assert_eq!(credit_of(&store, "bob").await, 30);
    assert_eq!(credit_of(&store, "alice").await, 120);
    assert_eq!(updated.state, DelegationState::Published);
    assert_eq!(updated.current_number, 0);
    assert!(updated.receivers.is_empty());
}

#[tokio::test]
async fn publisher_cancel_with_receivers_makes_them_whole() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "carol", 50).await;

    let delegation = engine.create("alice", &request(20, 2)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    engine.receive("carol", &delegation.id).await.unwrap();

    let canceled = engine.cancel("alice", &delegation.id).await.unwrap();
    assert_eq!(canceled.state, DelegationState::Canceled);
    assert_eq!(canceled.current_number, 0);
    assert!(canceled.receivers.is_empty());

    // Receivers end net positive by one reward each; the publisher's escrow
    // stays spent
    assert_eq!(credit_of(&store, "bob").await, 70);
    assert_eq!(credit_of(&store, "carol").await, 70);
    assert_eq!(credit_of(&store, "alice").await, 60);
    // Conservation: no credit minted or destroyed overall
    let total = credit_of(&store, "alice").await
        + credit_of(&store, "bob").await
        + credit_of(&store, "carol").await;
    assert_eq!(total, 200);
}

#[tokio::test]
async fn publisher_cancel_partial_fill_settles_only_occupied_slots() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 3)).await.unwrap();
    assert_eq!(credit_of(&store, "alice").await, 40);
    engine.receive("bob", &delegation.id).await.unwrap();

    let canceled = engine.cancel("alice", &delegation.id).await.unwrap();
    assert_eq!(canceled.state, DelegationState::Canceled);
    assert_eq!(canceled.current_number, 0);
    assert!(canceled.receivers.is_empty());

    // The occupied slot settles at 2x reward; the escrow for the two
    // unfilled slots stays spent
    assert_eq!(credit_of(&store, "bob").await, 70);
    assert_eq!(credit_of(&store, "alice").await, 40);
}

#[tokio::test]
async fn stranger_cannot_cancel() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "mallory", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    let err = engine.cancel("mallory", &delegation.id).await.unwrap_err();
    assert_rule(err, LifecycleError::Unauthorized);
}

#[tokio::test]
async fn cancel_rejected_in_terminal_state() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.cancel("alice", &delegation.id).await.unwrap();

    let err = engine.cancel("alice", &delegation.id).await.unwrap_err();
    assert_rule(
        err,
        LifecycleError::InvalidState {
            operation: "cancel",
            state: "canceled",
        },
    );
}

#[tokio::test]
async fn cancel_rejected_while_pending() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;

    let delegation = engine.create("alice", &request(20, 1)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    engine.finish("bob", &delegation.id).await.unwrap();

    let err = engine.cancel("alice", &delegation.id).await.unwrap_err();
    assert_rule(
        err,
        LifecycleError::InvalidState {
            operation: "cancel",
            state: "pending",
        },
    );
}

// Multi-receiver settlement

#[tokio::test]
async fn multi_receiver_slots_settle_individually() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "carol", 50).await;

    let delegation = engine.create("alice", &request(20, 2)).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();
    let full = engine.receive("carol", &delegation.id).await.unwrap();
    assert_eq!(full.state, DelegationState::Accepted);

    // First settlement consumes a slot instead of reopening it
    let after_bob = engine.finish("bob", &delegation.id).await.unwrap();
    assert_eq!(credit_of(&store, "bob").await, 70);
    assert_eq!(after_bob.max_number, 1);
    assert_eq!(after_bob.current_number, 1);
    assert_eq!(after_bob.state, DelegationState::Accepted);
    assert!(!engine.scheduler().is_armed(&delegation.id).await);

    // Last settlement finishes the delegation
    let after_carol = engine.finish("carol", &delegation.id).await.unwrap();
    assert_eq!(credit_of(&store, "carol").await, 70);
    assert_eq!(after_carol.max_number, 0);
    assert_eq!(after_carol.current_number, 0);
    assert_eq!(after_carol.state, DelegationState::Finished);

    // Conservation across the whole lifecycle
    let total = credit_of(&store, "alice").await
        + credit_of(&store, "bob").await
        + credit_of(&store, "carol").await;
    assert_eq!(total, 200);
}

#[tokio::test]
async fn occupancy_never_exceeds_capacity() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 200).await;
    for name in ["r1", "r2", "r3", "r4"] {
        add_user(&store, name, 50).await;
    }

    let delegation = engine.create("alice", &request(10, 3)).await.unwrap();
    for name in ["r1", "r2", "r3"] {
        let updated = engine.receive(name, &delegation.id).await.unwrap();
        assert!(updated.current_number <= updated.max_number);
        assert!(updated.current_number >= 0);
    }
    assert!(engine.receive("r4", &delegation.id).await.is_err());

    let updated = store.get_delegation(&delegation.id).await.unwrap();
    assert_eq!(updated.current_number, 3);
    assert_eq!(updated.receivers.len() as i64, updated.current_number);
}

// Questionnaires

#[tokio::test]
async fn questionnaire_fill_and_tally() {
    let (store, engine) = setup().await;
    add_user(&store, "alice", 100).await;
    add_user(&store, "bob", 50).await;
    add_user(&store, "mallory", 50).await;

    let mut req = request(10, 1);
    req.delegation_type = "questionnaire".to_string();
    req.questionnaire = Some(QuestionnaireDefinition {
        title: "canteen survey".to_string(),
        questions: vec![Question {
            topic: "favourite canteen?".to_string(),
            answers: vec![
                AnswerOption {
                    option: "east".to_string(),
                    count: 0,
                },
                AnswerOption {
                    option: "west".to_string(),
                    count: 0,
                },
            ],
        }],
    });
    let delegation = engine.create("alice", &req).await.unwrap();
    engine.receive("bob", &delegation.id).await.unwrap();

    let record = QuestionnaireRecord {
        questions: vec![Question {
            topic: "favourite canteen?".to_string(),
            answers: vec![
                AnswerOption {
                    option: "east".to_string(),
                    count: 1,
                },
                AnswerOption {
                    option: "west".to_string(),
                    count: 0,
                },
            ],
        }],
    };

    // Only current receivers may contribute
    let err = engine
        .fill_questionnaire("mallory", &delegation.id, &record)
        .await
        .unwrap_err();
    assert_rule(err, LifecycleError::Unauthorized);

    engine
        .fill_questionnaire("bob", &delegation.id, &record)
        .await
        .unwrap();

    // Full view is publisher-only and carries the tally
    let err = engine
        .full_questionnaire("bob", &delegation.id)
        .await
        .unwrap_err();
    assert_rule(err, LifecycleError::Unauthorized);

    let full = engine
        .full_questionnaire("alice", &delegation.id)
        .await
        .unwrap();
    assert_eq!(full.questions[0].answers[0].count, 1);
    assert_eq!(full.questions[0].answers[1].count, 0);

    // The filling view never exposes counts
    let preview = engine
        .questionnaire_for_filling(&delegation.id)
        .await
        .unwrap();
    assert_eq!(preview.questions[0].options, vec!["east", "west"]);
}
