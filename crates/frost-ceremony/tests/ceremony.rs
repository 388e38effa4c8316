//! Full ceremonies over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use frost_ceremony::backend::{backend_for, DealerOutput, PublicKeyPackage, Secp256k1Backend};
use frost_ceremony::coordinator::{CoordinatorState, StartSigning};
use frost_ceremony::orchestrator::{
    Approver, CoordinatorDriver, FixedApprover, ParticipantDriver, ParticipantOutcome,
};
use frost_ceremony::participant::{ApprovalRequest, ParticipantState};
use frost_ceremony::transport::{async_trait, MemoryTransport, Transport};
use frost_ceremony::{
    AbortReason, CeremonyConfig, CeremonyErrorCode, Error, ParticipantId, PeerKey, Result,
};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> CeremonyConfig {
    CeremonyConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_round_timeout(Duration::from_secs(5))
}

struct Harness {
    hub: MemoryTransport,
    coordinator: CoordinatorDriver,
    participants: Vec<ParticipantDriver>,
    public_key_package: PublicKeyPackage,
}

/// Deal keys and open a session with every participant joined
async fn setup(backend_id: &str, threshold: u16, total: u16, config: CeremonyConfig) -> Harness {
    init_tracing();
    let backend = backend_for(backend_id).unwrap();
    let DealerOutput {
        key_shares,
        public_key_package,
    } = backend.generate_key_shares(threshold, total).unwrap();

    let hub = MemoryTransport::new();
    let identities: Vec<PeerKey> = (0..total).map(|_| PeerKey::random()).collect();
    let coordinator_endpoint = Arc::new(hub.connect(PeerKey::random()));
    let coordinator_key = coordinator_endpoint.identity();

    let mut coordinator = CoordinatorDriver::new(coordinator_endpoint, config.clone());
    let session_id = coordinator
        .create_session(identities.clone(), threshold)
        .await
        .unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Waiting);

    let participants = key_shares
        .iter()
        .map(|share| {
            let identity = identities[usize::from(share.participant_id) - 1];
            let mut driver = ParticipantDriver::new(
                Arc::new(hub.connect(identity)),
                share.clone(),
                config.clone(),
            )
            .unwrap();
            driver.join(session_id, coordinator_key).unwrap();
            driver
        })
        .collect();

    Harness {
        hub,
        coordinator,
        participants,
        public_key_package,
    }
}

/// Never answers; the signer commits but never produces a share
struct SilentApprover;

#[async_trait]
impl Approver for SilentApprover {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        std::future::pending().await
    }
}

type Running = JoinHandle<(ParticipantDriver, Result<ParticipantOutcome>)>;

fn run_participant(mut driver: ParticipantDriver, approver: Arc<dyn Approver>) -> Running {
    tokio::spawn(async move {
        let outcome = driver.run(approver).await;
        (driver, outcome)
    })
}

/// Start the drivers for `ids`; everyone else stays offline
fn run_selected(
    participants: Vec<ParticipantDriver>,
    ids: &[ParticipantId],
    approver: impl Fn(ParticipantId) -> bool,
) -> Vec<Running> {
    participants
        .into_iter()
        .filter(|driver| ids.contains(&driver.participant_id()))
        .map(|driver| {
            let decision = approver(driver.participant_id());
            run_participant(driver, Arc::new(FixedApprover(decision)))
        })
        .collect()
}

fn ceremony_code(result: &Result<impl std::fmt::Debug>) -> Option<CeremonyErrorCode> {
    match result {
        Err(Error::Ceremony(error)) => Some(error.code),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_of_three_signing() {
    let Harness {
        hub,
        mut coordinator,
        participants,
        public_key_package,
    } = setup(Secp256k1Backend::PLAIN_ID, 2, 3, config()).await;

    let running = run_selected(participants, &[1, 2], |_| true);
    let message = b"transfer 10 units to account 42".to_vec();
    let request = StartSigning::new(message.clone(), vec![1, 2], public_key_package.clone()).unwrap();

    let outcome = coordinator.sign(request).await.unwrap();
    assert!(outcome.verified);
    assert_eq!(outcome.signer_ids, vec![1, 2]);
    assert_eq!(outcome.signature.len(), 65);
    assert_eq!(coordinator.state(), CoordinatorState::Complete);

    for handle in running {
        let (driver, result) = handle.await.unwrap();
        let seen = result.unwrap();
        assert_eq!(driver.state(), ParticipantState::Complete);
        assert_eq!(seen.signature, outcome.signature);
        assert_eq!(seen.attempt_id, outcome.attempt_id);
        assert!(seen.verified);
    }

    let backend = backend_for(Secp256k1Backend::PLAIN_ID).unwrap();
    assert!(backend
        .verify(
            &public_key_package.group_public_key,
            &message,
            &outcome.signature,
            None,
        )
        .unwrap());

    assert_eq!(hub.session_count(), 1);
    coordinator.reset().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerandomized_signing_with_all_participants() {
    let Harness {
        mut coordinator,
        participants,
        public_key_package,
        ..
    } = setup(Secp256k1Backend::RERANDOMIZED_ID, 2, 3, config()).await;

    let running = run_selected(participants, &[1, 2, 3], |_| true);
    let request = StartSigning::new(b"rotate keys".to_vec(), vec![1, 2, 3], public_key_package).unwrap();
    assert!(request.requires_randomizer);

    let outcome = coordinator.sign(request).await.unwrap();
    assert!(outcome.verified);
    assert_eq!(outcome.signer_ids, vec![1, 2, 3]);

    for handle in running {
        let (_, result) = handle.await.unwrap();
        assert_eq!(result.unwrap().signature, outcome.signature);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round1_timeout_below_threshold() {
    let config = config().with_round1_timeout(Duration::from_millis(300));
    let Harness {
        hub,
        mut coordinator,
        participants,
        public_key_package,
    } = setup(Secp256k1Backend::PLAIN_ID, 2, 3, config).await;

    // participant 1 never comes online
    let running = run_selected(participants, &[2], |_| true);
    let request = StartSigning::new(b"late".to_vec(), vec![1, 2], public_key_package).unwrap();

    let result = coordinator.sign(request).await;
    assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::Round1Timeout));
    assert_eq!(coordinator.state(), CoordinatorState::Failed);

    for handle in running {
        let (driver, result) = handle.await.unwrap();
        assert_eq!(driver.state(), ParticipantState::Failed);
        assert!(matches!(
            ceremony_code(&result),
            Some(CeremonyErrorCode::Aborted | CeremonyErrorCode::Round1Timeout)
        ));
    }

    coordinator.reset().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(hub.session_count(), 0);
    assert_eq!(
        coordinator.machine().last_error().map(|e| e.code),
        Some(CeremonyErrorCode::Round1Timeout)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operator_rejection_aborts_ceremony() {
    let Harness {
        hub,
        mut coordinator,
        participants,
        public_key_package,
    } = setup(Secp256k1Backend::PLAIN_ID, 2, 3, config()).await;

    let running = run_selected(participants, &[1, 2], |id| id != 2);
    let request = StartSigning::new(b"suspicious".to_vec(), vec![1, 2], public_key_package).unwrap();

    let result = coordinator.sign(request).await;
    assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::Aborted));
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(hub.session_count(), 0);

    // the approving signer may send its share into the closed session;
    // it still learns the reason from the queued abort
    for handle in running {
        let (driver, result) = handle.await.unwrap();
        assert_eq!(driver.state(), ParticipantState::Failed);
        assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::Aborted));
        assert!(driver.machine().signature().is_none());
        assert_eq!(driver.machine().abort_reason(), Some(AbortReason::UserCancelled));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_signer_silent_in_round2() {
    let config = config().with_round2_timeout(Duration::from_millis(300));
    let Harness {
        mut coordinator,
        participants,
        public_key_package,
        ..
    } = setup(Secp256k1Backend::PLAIN_ID, 2, 3, config).await;

    // all three commit, only 1 and 2 ever sign
    let running: Vec<Running> = participants
        .into_iter()
        .map(|driver| {
            let approver: Arc<dyn Approver> = if driver.participant_id() == 3 {
                Arc::new(SilentApprover)
            } else {
                Arc::new(FixedApprover(true))
            };
            run_participant(driver, approver)
        })
        .collect();
    let request = StartSigning::new(b"two of three".to_vec(), vec![1, 2, 3], public_key_package).unwrap();

    let result = coordinator.sign(request).await;
    assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::SignerDropped));
    assert_eq!(coordinator.state(), CoordinatorState::Failed);
    assert_eq!(coordinator.machine().attempt().unwrap().share_count(), 2);

    for handle in running {
        let (driver, result) = handle.await.unwrap();
        assert_eq!(driver.state(), ParticipantState::Failed);
        assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::Aborted));
        assert_eq!(driver.machine().abort_reason(), Some(AbortReason::Timeout));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_below_threshold_keeps_session() {
    let Harness {
        mut coordinator,
        public_key_package,
        ..
    } = setup(Secp256k1Backend::PLAIN_ID, 2, 3, config()).await;

    let request = StartSigning::new(b"solo".to_vec(), vec![1], public_key_package).unwrap();
    let result = coordinator.sign(request).await;
    assert_eq!(ceremony_code(&result), Some(CeremonyErrorCode::ThresholdNotMet));
    assert_eq!(coordinator.state(), CoordinatorState::Waiting);

    coordinator.cancel().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
}
