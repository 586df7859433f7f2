use anyhow::{bail, Context, Result};
use attend_core::matcher::{DEFAULT_MAX_DISTANCE, DEFAULT_MIN_GAP};
use attend_core::{
    encode_embedding, DirectorySource, Embedding, IdentitySource, MatchCandidate, MatchDecision,
    MatchOutcome, MatchPolicy, Matcher, NearestNeighborMatcher, Repository,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "attend", about = "Attendance sign-in matching tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the identities an identity directory would load
    Inspect {
        /// Identity record directory
        #[arg(short, long, env = "ATTEND_IDENTITY_DIR")]
        dir: PathBuf,
        /// Required embedding dimension (0 infers it from the first record)
        #[arg(long, default_value_t = 0)]
        dim: usize,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Match one query embedding against an identity directory
    Match {
        /// JSON file holding the query as an array of floats
        #[arg(short, long)]
        query: PathBuf,
        #[arg(short, long, env = "ATTEND_IDENTITY_DIR")]
        dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        dim: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_DISTANCE)]
        max_distance: f64,
        #[arg(long, default_value_t = DEFAULT_MIN_GAP)]
        min_gap: f64,
        #[arg(long)]
        json: bool,
    },
    /// Print the stored base64 form of an embedding
    Encode {
        /// JSON file holding the embedding as an array of floats
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { dir, dim, json } => inspect(&dir, dim, json),
        Commands::Match {
            query,
            dir,
            dim,
            max_distance,
            min_gap,
            json,
        } => {
            let policy = MatchPolicy {
                max_distance,
                min_gap,
            };
            run_match(&query, &dir, dim, policy, json)
        }
        Commands::Encode { file } => {
            let embedding = read_embedding(&file)?;
            println!("{}", encode_embedding(&embedding));
            Ok(())
        }
    }
}

fn inspect(dir: &Path, dim: usize, as_json: bool) -> Result<()> {
    let source = DirectorySource::new(dir, (dim > 0).then_some(dim));
    let report = source
        .load()
        .with_context(|| format!("loading {}", source.describe()))?;

    if as_json {
        let identities: Vec<Value> = report
            .snapshot
            .identities()
            .iter()
            .map(|i| json!({ "id": i.id, "name": i.display_name, "samples": i.embeddings.len() }))
            .collect();
        let skipped: Vec<Value> = report
            .skipped
            .iter()
            .map(|s| json!({ "origin": s.origin, "error": s.error.to_string() }))
            .collect();
        let out = json!({
            "dimension": report.snapshot.dimension(),
            "identities": identities,
            "skipped": skipped,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let dimension = report
        .snapshot
        .dimension()
        .map_or_else(|| "-".to_string(), |d| d.to_string());
    println!(
        "{} identities loaded from {} (dimension {dimension})",
        report.loaded(),
        dir.display()
    );
    for identity in report.snapshot.identities() {
        println!(
            "  {:<12} {:<32} {} samples",
            identity.id,
            identity.display_name,
            identity.embeddings.len()
        );
    }
    if !report.skipped.is_empty() {
        println!("{} records skipped:", report.skipped.len());
        for skipped in &report.skipped {
            println!("  {skipped}");
        }
    }
    Ok(())
}

fn run_match(
    query: &Path,
    dir: &Path,
    dim: usize,
    policy: MatchPolicy,
    as_json: bool,
) -> Result<()> {
    let query = read_embedding(query)?;
    let repository = Repository::new(DirectorySource::new(dir, (dim > 0).then_some(dim)));
    repository
        .reload()
        .with_context(|| format!("loading {}", repository.describe()))?;

    let matcher = NearestNeighborMatcher::new(policy);
    let outcome = matcher.decide(&query, &repository.snapshot())?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
        return Ok(());
    }

    println!("{}", outcome.summary());
    for (label, candidate) in [("best", &outcome.best), ("runner-up", &outcome.runner_up)] {
        if let Some(c) = candidate {
            println!(
                "  {label:<10} {} ({}) distance {:.4} confidence {:.1}%",
                c.display_name,
                c.identity_id,
                c.best_distance,
                c.confidence()
            );
        }
    }
    Ok(())
}

fn outcome_json(outcome: &MatchOutcome) -> Value {
    let candidate = |c: &Option<MatchCandidate>| {
        c.as_ref().map(|c| {
            json!({
                "identity_id": c.identity_id,
                "display_name": c.display_name,
                "distance": c.best_distance,
                "confidence": c.confidence(),
            })
        })
    };
    let decision = match &outcome.decision {
        MatchDecision::Accepted(m) => json!({
            "accepted": true,
            "identity_id": m.identity_id,
            "display_name": m.display_name,
            "confidence": m.confidence(),
        }),
        MatchDecision::Rejected { reason } => json!({ "accepted": false, "reason": reason }),
    };
    json!({
        "decision": decision,
        "best": candidate(&outcome.best),
        "runner_up": candidate(&outcome.runner_up),
        "gap": outcome.gap(),
    })
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f64> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    let embedding = Embedding::new(values);
    if embedding.is_empty() {
        bail!("{} holds an empty embedding", path.display());
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::{AcceptedMatch, RejectReason};

    #[test]
    fn test_cli_parses_match_defaults() {
        let cli = Cli::try_parse_from(["attend", "match", "--query", "q.json", "--dir", "/ids"])
            .unwrap();
        match cli.command {
            Commands::Match {
                max_distance,
                min_gap,
                dim,
                json,
                ..
            } => {
                assert_eq!(max_distance, DEFAULT_MAX_DISTANCE);
                assert_eq!(min_gap, DEFAULT_MIN_GAP);
                assert_eq!(dim, 0);
                assert!(!json);
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_read_embedding_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(read_embedding(&path).is_err());
        std::fs::write(&path, "[0.5, 0.25]").unwrap();
        assert_eq!(read_embedding(&path).unwrap().values(), &[0.5, 0.25]);
    }

    #[test]
    fn test_outcome_json_shape() {
        let best = MatchCandidate {
            identity_id: "7".into(),
            display_name: "Somchai".into(),
            best_distance: 0.1,
            best_embedding_index: 0,
        };
        let accepted = MatchOutcome {
            decision: MatchDecision::Accepted(AcceptedMatch::from(&best)),
            best: Some(best),
            runner_up: None,
        };
        let v = outcome_json(&accepted);
        assert_eq!(v["decision"]["accepted"], true);
        assert_eq!(v["decision"]["identity_id"], "7");
        assert!(v["runner_up"].is_null());

        let rejected = MatchOutcome {
            decision: MatchDecision::Rejected {
                reason: RejectReason::NoFace,
            },
            best: None,
            runner_up: None,
        };
        assert_eq!(outcome_json(&rejected)["decision"]["reason"], "no_face");
    }
}
