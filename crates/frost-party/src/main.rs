//! FROST Party CLI
//!
//! Command-line interface for threshold signing ceremonies:
//! - Trusted-dealer key generation
//! - Running a local ceremony (coordinator plus signers) in-process
//! - Validating a protocol envelope
//! - Showing key share info

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use frost_ceremony::backend::{backend_for, KeyShare, PublicKeyPackage, Secp256k1Backend};
use frost_ceremony::coordinator::StartSigning;
use frost_ceremony::orchestrator::{Approver, CoordinatorDriver, FixedApprover, ParticipantDriver};
use frost_ceremony::participant::ApprovalRequest;
use frost_ceremony::transport::{MemoryTransport, Transport};
use frost_ceremony::validation::{self, Freshness, ValidationContext};
use frost_ceremony::{CeremonyConfig, DedupSet, ParticipantId, PeerKey, ProtocolPhase, SessionId};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};

const PUBLIC_KEY_PACKAGE_FILE: &str = "public_key_package.json";

/// FROST Party - threshold signing ceremony node
#[derive(Parser)]
#[command(name = "frost-party")]
#[command(about = "FROST threshold signing ceremony tool")]
#[command(version = frost_ceremony::VERSION)]
struct Cli {
    /// Data directory for key shares
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Ceremony configuration file (JSON)
    #[arg(short, long, env = "FROST_CONFIG")]
    config: Option<PathBuf>,

    /// Override every round timeout (seconds)
    #[arg(long, env = "ROUND_TIMEOUT")]
    round_timeout: Option<u64>,

    /// Override the transport poll interval (milliseconds)
    #[arg(long, env = "POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deal key shares with a trusted dealer
    Keygen {
        /// Threshold (t-of-n)
        #[arg(short, long)]
        threshold: u16,

        /// Number of participants
        #[arg(short = 'n', long)]
        total: u16,

        /// Signing backend
        #[arg(short, long, default_value = Secp256k1Backend::PLAIN_ID)]
        backend: String,
    },

    /// Run a full ceremony locally over the in-memory transport
    Run {
        /// Message to sign
        #[arg(short, long)]
        message: String,

        /// Treat the message as hex
        #[arg(long)]
        hex: bool,

        /// Participating signer IDs (comma-separated)
        #[arg(short, long)]
        signers: String,

        /// Approve on behalf of every signer without prompting
        #[arg(long)]
        approve: bool,
    },

    /// Validate an envelope file against a session
    Validate {
        /// Envelope JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Expected session ID
        #[arg(short, long)]
        session: SessionId,

        /// Protocol phase of the receiving machine
        #[arg(short, long, value_enum, default_value_t = PhaseArg::Idle)]
        phase: PhaseArg,

        /// Skip timestamp freshness checks
        #[arg(long)]
        no_freshness: bool,
    },

    /// Show key share info
    Info {
        /// Participant ID (1-indexed)
        #[arg(short, long)]
        participant: ParticipantId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PhaseArg {
    Idle,
    Round1,
    CommitmentsSent,
    Round2,
    Complete,
}

impl From<PhaseArg> for ProtocolPhase {
    fn from(phase: PhaseArg) -> Self {
        match phase {
            PhaseArg::Idle => ProtocolPhase::Idle,
            PhaseArg::Round1 => ProtocolPhase::Round1,
            PhaseArg::CommitmentsSent => ProtocolPhase::CommitmentsSent,
            PhaseArg::Round2 => ProtocolPhase::Round2,
            PhaseArg::Complete => ProtocolPhase::Complete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if cli.json {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter(filter)
            .init();
    }

    match cli.command {
        Commands::Keygen {
            threshold,
            total,
            ref backend,
        } => {
            run_keygen(&cli, threshold, total, backend)?;
        }
        Commands::Run {
            ref message,
            hex,
            ref signers,
            approve,
        } => {
            run_ceremony(&cli, message, hex, signers, approve).await?;
        }
        Commands::Validate {
            ref file,
            session,
            phase,
            no_freshness,
        } => {
            run_validate(file, session, phase, no_freshness)?;
        }
        Commands::Info { participant } => {
            show_info(&cli, participant)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<CeremonyConfig> {
    let mut config = match &cli.config {
        Some(path) => CeremonyConfig::load(path)?,
        None => CeremonyConfig::default(),
    };
    if let Some(secs) = cli.round_timeout {
        config = config.with_round_timeout(Duration::from_secs(secs));
    }
    if let Some(ms) = cli.poll_interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

fn run_keygen(cli: &Cli, threshold: u16, total: u16, backend_id: &str) -> Result<()> {
    info!(threshold, total, backend = backend_id, "Dealing key shares");

    let backend = backend_for(backend_id)?;
    let dealer = backend.generate_key_shares(threshold, total)?;

    std::fs::create_dir_all(&cli.dest)?;
    for share in &dealer.key_shares {
        let path = key_share_path(&cli.dest, share.participant_id);
        std::fs::write(&path, serde_json::to_string_pretty(share)?)?;
        info!(participant_id = share.participant_id, path = ?path, "Key share saved");
    }

    let package_path = cli.dest.join(PUBLIC_KEY_PACKAGE_FILE);
    std::fs::write(
        &package_path,
        serde_json::to_string_pretty(&dealer.public_key_package)?,
    )?;

    let group_key = hex::encode(&dealer.public_key_package.group_public_key);
    info!(group_public_key = %group_key, path = ?package_path, "Key generation completed");
    println!("Group Public Key: {}", group_key);

    Ok(())
}

async fn run_ceremony(
    cli: &Cli,
    message: &str,
    is_hex: bool,
    signers: &str,
    approve: bool,
) -> Result<()> {
    let config = load_config(cli)?;
    let public_key_package = load_public_key_package(&cli.dest)?;
    let signer_ids = parse_signers(signers)?;
    let message = if is_hex {
        hex::decode(message).context("Message is not valid hex")?
    } else {
        message.as_bytes().to_vec()
    };

    let key_shares = signer_ids
        .iter()
        .map(|&id| load_key_share(&cli.dest, id))
        .collect::<Result<Vec<_>>>()?;
    let threshold = key_shares
        .first()
        .map(|share| share.threshold)
        .context("No signers given")?;

    // one transport identity per participant of the key group
    let hub = MemoryTransport::new();
    let identities: Vec<PeerKey> = public_key_package
        .verifying_shares
        .iter()
        .map(|_| PeerKey::random())
        .collect();
    let coordinator_endpoint = Arc::new(hub.connect(PeerKey::random()));
    let coordinator_key = coordinator_endpoint.identity();

    let mut coordinator = CoordinatorDriver::new(coordinator_endpoint, config.clone());
    let session_id = coordinator
        .create_session(identities.clone(), threshold)
        .await?;

    info!(
        %session_id,
        signers = ?signer_ids,
        message_len = message.len(),
        "Starting local ceremony"
    );

    let approver: Arc<dyn Approver> = if approve {
        Arc::new(FixedApprover(true))
    } else {
        Arc::new(PromptApprover::default())
    };

    let mut running = Vec::with_capacity(key_shares.len());
    for share in key_shares {
        let participant_id = share.participant_id;
        let identity = identities
            .get(usize::from(participant_id).saturating_sub(1))
            .copied()
            .with_context(|| format!("Participant {} is not in the key group", participant_id))?;
        let mut driver = ParticipantDriver::new(Arc::new(hub.connect(identity)), share, config.clone())?;
        driver.join(session_id, coordinator_key)?;

        let approver = approver.clone();
        running.push(tokio::spawn(async move {
            (participant_id, driver.run(approver).await)
        }));
    }

    let request = StartSigning::new(message, signer_ids, public_key_package)?;
    let outcome = coordinator.sign(request).await;

    for handle in running {
        let (participant_id, result) = handle.await?;
        match result {
            Ok(seen) => info!(participant_id, verified = seen.verified, "Participant finished"),
            Err(e) => warn!(participant_id, error = %e, "Participant failed"),
        }
    }

    let outcome = outcome?;
    coordinator.reset().await?;

    println!("Signature:");
    println!("  signers:  {:?}", outcome.signer_ids);
    println!("  value:    {}", hex::encode(&outcome.signature));
    println!("  verified: {}", outcome.verified);

    Ok(())
}

fn run_validate(file: &Path, session_id: SessionId, phase: PhaseArg, no_freshness: bool) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("Reading {}", file.display()))?;
    let freshness = (!no_freshness).then(Freshness::now);

    let mut dedup = DedupSet::new();
    let mut ctx = ValidationContext::new(session_id, &mut dedup)
        .phase(phase.into())
        .freshness(freshness);

    match validation::validate(&raw, &mut ctx) {
        Ok(envelope) => {
            println!("Valid {} message {}", envelope.message_type(), envelope.message_id);
            Ok(())
        }
        Err(error) => {
            println!("{}", serde_json::to_string_pretty(&error)?);
            bail!("Envelope rejected: {}", error.code)
        }
    }
}

fn show_info(cli: &Cli, participant_id: ParticipantId) -> Result<()> {
    let key_share = load_key_share(&cli.dest, participant_id)?;

    println!("Key Share Info:");
    println!("  Participant ID: {}", key_share.participant_id);
    println!("  Backend: {}", key_share.backend_id);
    println!("  Participants: {}", key_share.total_participants);
    println!("  Threshold: {}", key_share.threshold);
    println!("  Group Public Key: {}", hex::encode(&key_share.group_public_key));

    Ok(())
}

fn key_share_path(dest: &Path, participant_id: ParticipantId) -> PathBuf {
    dest.join(format!("keyshare.{}.json", participant_id))
}

fn load_key_share(dest: &Path, participant_id: ParticipantId) -> Result<KeyShare> {
    let path = key_share_path(dest, participant_id);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Reading key share {}", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn load_public_key_package(dest: &Path) -> Result<PublicKeyPackage> {
    let path = dest.join(PUBLIC_KEY_PACKAGE_FILE);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Reading {}", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_signers(signers: &str) -> Result<Vec<ParticipantId>> {
    let ids = signers
        .split(',')
        .map(|s| s.trim().parse())
        .collect::<std::result::Result<Vec<ParticipantId>, _>>()
        .with_context(|| format!("Invalid signer list `{}`", signers))?;
    if ids.is_empty() {
        bail!("Signer list is empty");
    }
    Ok(ids)
}

/// Asks on the terminal, one signer at a time
#[derive(Default)]
struct PromptApprover {
    lock: Mutex<()>,
}

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&self, request: &ApprovalRequest) -> bool {
        let _turn = self.lock.lock().await;
        let prompt = format!(
            "Signers {:?} request a signature on:\n  text: {}\n  hex:  {}\nApprove? [y/N] ",
            request.signer_ids,
            String::from_utf8_lossy(&request.message),
            hex::encode(&request.message)
        );

        let answer = tokio::task::spawn_blocking(move || {
            print!("{}", prompt);
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok::<_, io::Error>(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keygen() {
        let cli = Cli::try_parse_from([
            "frost-party",
            "--dest",
            "/tmp/keys",
            "keygen",
            "-t",
            "2",
            "-n",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.dest, PathBuf::from("/tmp/keys"));
        match cli.command {
            Commands::Keygen {
                threshold,
                total,
                backend,
            } => {
                assert_eq!((threshold, total), (2, 3));
                assert_eq!(backend, Secp256k1Backend::PLAIN_ID);
            }
            _ => panic!("expected keygen"),
        }
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "frost-party",
            "--round-timeout",
            "30",
            "run",
            "--message",
            "hello",
            "--signers",
            "1, 3",
            "--approve",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.round1_timeout, Duration::from_secs(30));
        match cli.command {
            Commands::Run {
                signers, approve, ..
            } => {
                assert!(approve);
                assert_eq!(parse_signers(&signers).unwrap(), vec![1, 3]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_validate_phase() {
        let session = uuid_string();
        let cli = Cli::try_parse_from([
            "frost-party",
            "validate",
            "--file",
            "envelope.json",
            "--session",
            session.as_str(),
            "--phase",
            "commitments-sent",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate { phase, .. } => {
                assert_eq!(ProtocolPhase::from(phase), ProtocolPhase::CommitmentsSent)
            }
            _ => panic!("expected validate"),
        }
    }

    #[test]
    fn test_invalid_signers() {
        assert!(parse_signers("1,x").is_err());
        assert!(parse_signers("").is_err());
    }

    fn uuid_string() -> String {
        "8c5a1c1e-3f64-4a43-9d5e-2f2b0f6d7a10".to_string()
    }
}
