//! Subcommand implementations.
//!
//! Each command prints its result on stdout and returns the process exit
//! code: 0 match, 1 mismatch. Errors propagate to `main`, which maps them to
//! 2 (not found) or 3.

use crate::config::FabricConfig;
use clap::Subcommand;
use color_eyre::eyre::{Result, WrapErr, eyre};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use verity_core::Digest;
use verity_federation::IdentityRegistry;
use verity_integrity::{MerkleProof, MerkleTree, PackManifest, compute_pack_integrity, verify_proof};
use verity_policy::{
    CompiledBundle, GateKind, PolicyBundle, PolicyContext, PolicyGate, Verdict,
    default_strict_bundle,
};
use verity_replay::{ReplayEngine, RunView, diff_runs, verify_replay_determinism};
use verity_storage::{RunRepository, open_store};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a stored run and verify its fingerprint
    Replay {
        /// Run id or unique prefix
        run: String,
        /// Use this bundle instead of the one pinned with the run
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Skip the replay and post-execution gates
        #[arg(long)]
        no_gates: bool,
        #[arg(long)]
        json: bool,
    },
    /// Compare two stored runs field by field
    DiffRun {
        a: String,
        b: String,
        #[arg(long)]
        json: bool,
    },
    /// Replay a run several times and check every fingerprint agrees
    VerifyDeterminism {
        run: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        json: bool,
    },
    /// List stored runs
    Runs,
    /// Policy bundle tools
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Merkle tree tools
    Merkle {
        #[command(subcommand)]
        command: MerkleCommand,
    },
    /// Compute a pack's integrity anchor, optionally checking it
    PackIntegrity {
        /// Pack manifest (JSON)
        manifest: PathBuf,
        /// Graph data file
        graph: PathBuf,
        /// Expected Merkle root
        #[arg(long)]
        expect: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Federation tools
    Federation {
        #[command(subcommand)]
        command: FederationCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Print a bundle's policy version
    Version {
        /// Bundle file; defaults to the configured or strict bundle
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Evaluate a gate against a JSON context
    Check {
        /// Context document (JSON)
        context: PathBuf,
        #[arg(long)]
        bundle: Option<PathBuf>,
        /// pre-execution, tool-call, post-execution or replay
        #[arg(long, default_value = "pre-execution")]
        gate: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum MerkleCommand {
    /// Root over a set of CIDs
    Root { cids: Vec<String> },
    /// Inclusion proof for one CID
    Prove {
        #[arg(long)]
        cid: String,
        cids: Vec<String>,
    },
    /// Check a proof file against a root
    Verify {
        proof: PathBuf,
        #[arg(long)]
        root: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum FederationCommand {
    /// Snapshot hash of an identity registry file
    RegistryHash { identities: PathBuf },
}

/// Run one command
pub fn run(command: Command, config: &FabricConfig) -> Result<u8> {
    match command {
        Command::Replay {
            run,
            policy,
            no_gates,
            json,
        } => replay(config, &run, policy.as_deref(), no_gates, json),
        Command::DiffRun { a, b, json } => diff_run(config, &a, &b, json),
        Command::VerifyDeterminism { run, runs, json } => {
            verify_determinism(config, &run, runs, json)
        }
        Command::Runs => list_runs(config),
        Command::Policy { command } => match command {
            PolicyCommand::Version { bundle } => policy_version(config, bundle.as_deref()),
            PolicyCommand::Check {
                context,
                bundle,
                gate,
            } => policy_check(config, &context, bundle.as_deref(), &gate),
        },
        Command::Merkle { command } => match command {
            MerkleCommand::Root { cids } => merkle_root(&cids),
            MerkleCommand::Prove { cid, cids } => merkle_prove(&cid, &cids),
            MerkleCommand::Verify { proof, root } => merkle_verify(&proof, &root),
        },
        Command::PackIntegrity {
            manifest,
            graph,
            expect,
            json,
        } => pack_integrity(&manifest, &graph, expect.as_deref(), json),
        Command::Federation { command } => match command {
            FederationCommand::RegistryHash { identities } => registry_hash(&identities),
        },
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    serde_json::from_str(&read_text(path)?)
        .wrap_err_with(|| format!("{} is not valid JSON for this command", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn repository(config: &FabricConfig) -> Result<RunRepository> {
    let store = open_store(&config.store).wrap_err("failed to open run store")?;
    Ok(RunRepository::new(store))
}

/// Explicit file, then configured file, then the strict bundle
fn load_bundle(config: &FabricConfig, path: Option<&Path>) -> Result<CompiledBundle> {
    match path.or(config.policy.bundle_path.as_deref()) {
        Some(path) => PolicyBundle::load_json(&read_text(path)?)
            .wrap_err_with(|| format!("failed to load policy bundle {}", path.display())),
        None => Ok(default_strict_bundle()?),
    }
}

fn pinned_bundle(repo: &RunRepository, run_id: &str) -> Result<CompiledBundle> {
    let document = repo.load_policy(run_id)?;
    PolicyBundle::load_value(&document)
        .wrap_err_with(|| format!("policy pinned with run {run_id} does not load"))
}

fn replay(
    config: &FabricConfig,
    run: &str,
    policy: Option<&Path>,
    no_gates: bool,
    json: bool,
) -> Result<u8> {
    let repo = repository(config)?;
    let run_id = repo.resolve(run)?;
    let stored = repo.load_run(&run_id)?;
    let bundle = match policy {
        Some(path) => load_bundle(config, Some(path))?,
        None => pinned_bundle(&repo, &run_id)?,
    };

    let mut replay_config = config.replay.clone();
    replay_config.evaluate_gates &= !no_gates;
    let engine = ReplayEngine::new(config.engine_version).with_config(replay_config);
    let report = engine.replay(&stored.manifest, &stored.plain_events(), &Arc::new(bundle))?;

    if json {
        print_json(&report)?;
    } else {
        print!("{}", report.render_human());
    }
    Ok(u8::from(report.exit_code() != 0))
}

fn diff_run(config: &FabricConfig, a: &str, b: &str, json: bool) -> Result<u8> {
    let repo = repository(config)?;
    let run_a = repo.load_run(&repo.resolve(a)?)?;
    let run_b = repo.load_run(&repo.resolve(b)?)?;
    let diff = diff_runs(
        RunView {
            manifest: &run_a.manifest,
            events: &run_a.events,
        },
        RunView {
            manifest: &run_b.manifest,
            events: &run_b.events,
        },
    )?;
    if json {
        print_json(&diff)?;
    } else {
        print!("{}", diff.render_table());
    }
    Ok(u8::from(!diff.identical))
}

fn verify_determinism(config: &FabricConfig, run: &str, runs: usize, json: bool) -> Result<u8> {
    let repo = repository(config)?;
    let run_id = repo.resolve(run)?;
    let stored = repo.load_run(&run_id)?;
    let bundle = Arc::new(pinned_bundle(&repo, &run_id)?);
    let engine = ReplayEngine::new(config.engine_version).with_config(config.replay.clone());
    let report =
        verify_replay_determinism(&engine, &stored.manifest, &stored.plain_events(), &bundle, runs)?;

    if json {
        print_json(&report)?;
    } else {
        let verdict = if report.deterministic {
            "deterministic"
        } else {
            "NOT deterministic"
        };
        println!("run {run_id}: {verdict} over {} replays", report.runs);
        for (i, fingerprint) in report.fingerprints.iter().enumerate() {
            println!("  #{i}: {fingerprint}");
        }
    }
    Ok(u8::from(report.exit_code() != 0))
}

fn list_runs(config: &FabricConfig) -> Result<u8> {
    let repo = repository(config)?;
    for id in repo.list_runs()? {
        let manifest = repo.load_manifest(&id)?;
        println!(
            "{id}  events={}  fingerprint={}",
            manifest.event_count,
            manifest.fingerprint.short()
        );
    }
    Ok(0)
}

fn policy_version(config: &FabricConfig, bundle: Option<&Path>) -> Result<u8> {
    let bundle = load_bundle(config, bundle)?;
    println!("{}  {}", bundle.policy_version(), bundle.name());
    Ok(0)
}

fn parse_gate(name: &str) -> Result<GateKind> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| eyre!("unknown gate `{name}`"))
}

fn policy_check(
    config: &FabricConfig,
    context: &Path,
    bundle: Option<&Path>,
    gate: &str,
) -> Result<u8> {
    let gate = parse_gate(gate)?;
    let bundle = Arc::new(load_bundle(config, bundle)?);
    let context = PolicyContext::new(read_json(context)?)?;
    let policy_gate = PolicyGate::new(bundle).with_mode(config.policy.mode);
    let evaluation = policy_gate.evaluate(gate, &context);

    match &evaluation.verdict {
        Verdict::Allow => println!("{gate}: allow"),
        Verdict::Deny {
            rule_id,
            message,
            suggestion,
        } => {
            println!("{gate}: deny [{rule_id}] {message}");
            if !suggestion.is_empty() {
                println!("  suggestion: {suggestion}");
            }
        }
    }
    for annotation in &evaluation.annotations {
        println!(
            "  {} [{}] {}",
            annotation.severity, annotation.rule_id, annotation.message
        );
    }
    Ok(u8::from(!evaluation.verdict.is_allow()))
}

fn merkle_root(cids: &[String]) -> Result<u8> {
    let tree = MerkleTree::from_hex(cids)?;
    println!("{}", tree.root());
    Ok(0)
}

fn merkle_prove(cid: &str, cids: &[String]) -> Result<u8> {
    let tree = MerkleTree::from_hex(cids)?;
    let proof = tree.proof_for(&Digest::from_hex(cid)?)?;
    print_json(&proof)?;
    Ok(0)
}

fn merkle_verify(proof: &Path, root: &str) -> Result<u8> {
    let proof: MerkleProof = read_json(proof)?;
    let valid = verify_proof(&proof, &Digest::from_hex(root)?);
    println!("{}", if valid { "valid" } else { "invalid" });
    Ok(u8::from(!valid))
}

fn pack_integrity(manifest: &Path, graph: &Path, expect: Option<&str>, json: bool) -> Result<u8> {
    let pack: PackManifest = read_json(manifest)?;
    let graph_data =
        std::fs::read(graph).wrap_err_with(|| format!("failed to read {}", graph.display()))?;
    let integrity = compute_pack_integrity(&pack, &graph_data)?;

    if json {
        print_json(&integrity)?;
    } else {
        println!("pack {}  root {}", integrity.pack_id, integrity.merkle_root);
        for (component, cid) in &integrity.components {
            println!("  {component:<14} {cid}");
        }
    }
    match expect {
        Some(expected) => {
            let matches = Digest::from_hex(expected)? == integrity.merkle_root;
            if !matches {
                eprintln!("merkle root does not match {expected}");
            }
            Ok(u8::from(!matches))
        }
        None => Ok(0),
    }
}

fn registry_hash(identities: &Path) -> Result<u8> {
    let registry = IdentityRegistry::from_json(&read_text(identities)?)
        .wrap_err("identity file is not a list of node identities")?;
    println!("{}  ({} nodes)", registry.snapshot_hash()?, registry.len());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verity_core::Version;
    use verity_log::{Artifact, ExecutionContext, RunRecorder};
    use verity_storage::StoreConfig;

    fn config(root: &Path) -> FabricConfig {
        FabricConfig {
            store: StoreConfig {
                root: root.to_path_buf(),
                ..StoreConfig::default()
            },
            ..FabricConfig::default()
        }
    }

    fn record(config: &FabricConfig, n: i64) -> String {
        let bundle = default_strict_bundle().unwrap();
        let inputs = json!({"n": n});
        let ctx = ExecutionContext::new(Version::new(1, 0, 0), bundle.policy_version().clone())
            .with_inputs(&inputs)
            .unwrap();
        let mut recorder = RunRecorder::start(ctx).unwrap();
        recorder.state("doubled", json!(n * 2)).unwrap();
        recorder.tool_call("c1", "fetch", json!({"url": "a"}), json!({"status": 200})).unwrap();
        recorder.artifact(Artifact::new("out.txt", format!("{}", n * 2))).unwrap();
        let run = recorder.complete(json!({"result": n * 2})).unwrap();
        let policy: Value = serde_json::from_str(&bundle.to_json().unwrap()).unwrap();
        repository(config)
            .unwrap()
            .save_run(&run, &inputs, &policy)
            .unwrap()
    }

    #[test]
    fn test_replay_stored_run_matches() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let id = record(&config, 3);
        assert_eq!(replay(&config, &id[..12], None, false, true).unwrap(), 0);
        assert_eq!(verify_determinism(&config, &id, 3, false).unwrap(), 0);
    }

    #[test]
    fn test_replay_with_other_bundle_is_version_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let id = record(&config, 3);
        let bundle_path = dir.path().join("other.json");
        let other = PolicyBundle::new("other", "1").compile().unwrap();
        std::fs::write(&bundle_path, other.to_json().unwrap()).unwrap();
        assert!(replay(&config, &id, Some(&bundle_path), false, false).is_err());
    }

    #[test]
    fn test_missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = replay(&config(dir.path()), "deadbeef", None, false, false).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 2);
    }

    #[test]
    fn test_diff_of_different_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let a = record(&config, 1);
        let b = record(&config, 2);
        assert_eq!(diff_run(&config, &a, &a, false).unwrap(), 0);
        assert_eq!(diff_run(&config, &a, &b, true).unwrap(), 1);
        assert_eq!(list_runs(&config).unwrap(), 0);
    }

    #[test]
    fn test_policy_check_denies_disallowed_tool() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let context = dir.path().join("ctx.json");
        std::fs::write(
            &context,
            json!({"tool": "disallowed-tool", "allowed_tools": ["fetch"]}).to_string(),
        )
        .unwrap();
        assert_eq!(policy_check(&config, &context, None, "tool-call").unwrap(), 1);
        assert!(policy_check(&config, &context, None, "no-such-gate").is_err());
    }

    #[test]
    fn test_merkle_prove_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let cids: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|s| Digest::sha256(s.as_bytes()).to_hex())
            .collect();
        let tree = MerkleTree::from_hex(&cids).unwrap();
        let proof = tree.proof_for(&Digest::from_hex(&cids[1]).unwrap()).unwrap();
        let path = dir.path().join("proof.json");
        std::fs::write(&path, serde_json::to_string(&proof).unwrap()).unwrap();

        assert_eq!(merkle_verify(&path, &tree.root().to_hex()).unwrap(), 0);
        let wrong = Digest::sha256(b"other").to_hex();
        assert_eq!(merkle_verify(&path, &wrong).unwrap(), 1);
        assert_eq!(merkle_root(&cids).unwrap(), 0);
    }

    #[test]
    fn test_pack_integrity_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("pack.json");
        let graph = dir.path().join("graph.json");
        std::fs::write(
            &manifest,
            json!({
                "metadata": {"id": "pack.demo", "version": "1.0.0", "name": "Demo"},
                "spec_version": "1.0",
                "declared_tools": ["fetch"],
                "deterministic": true
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(&graph, br#"{"nodes":[],"edges":[]}"#).unwrap();

        let pack: PackManifest = read_json(&manifest).unwrap();
        let root = compute_pack_integrity(&pack, &std::fs::read(&graph).unwrap())
            .unwrap()
            .merkle_root
            .to_hex();
        assert_eq!(pack_integrity(&manifest, &graph, Some(&root), false).unwrap(), 0);
        let wrong = Digest::sha256(b"x").to_hex();
        assert_eq!(pack_integrity(&manifest, &graph, Some(&wrong), true).unwrap(), 1);
    }
}
