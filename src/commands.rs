//! One-shot CLI commands.
//!
//! Each `run_*` function builds a [`Bridge`] from the loaded config, does
//! its one job against the companion, prints the result, and closes the
//! connection again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{Read, Write};

use crate::apply::{AcceptDefault, Confirm, Proposal};
use crate::bridge::Bridge;
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::predictor::SimilarityResult;

async fn start_bridge(config: &Config) -> Result<Bridge> {
    let bridge = Bridge::new(config.clone())?;
    let state = bridge.start().await;
    if state != ConnectionState::Open {
        tracing::warn!(
            endpoint = %bridge.connection().endpoint(),
            "companion not reachable yet"
        );
    }
    Ok(bridge)
}

/// Read the snippet argument; `-` means stdin.
fn read_snippet(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read snippet from stdin")?;
    Ok(buf)
}

/// Fill the cache with `files`, or with every known file when empty.
async fn load_corpus(bridge: &Bridge, files: Vec<String>) -> Result<()> {
    let paths = if files.is_empty() {
        let known = bridge.list_files().await?;
        if known.is_empty() {
            anyhow::bail!("companion reported no workspace files");
        }
        known
    } else {
        files
    };

    let report = bridge.populate_cache(Some(paths)).await;
    for failure in &report.failed {
        eprintln!("warning: {}: {}", failure.file_path, failure.error);
    }
    Ok(())
}

fn print_ranked(ranked: &[SimilarityResult]) {
    println!("{:>7}  FILE", "SCORE");
    for result in ranked {
        println!("{:>6.1}%  {}", result.score * 100.0, result.file_name);
    }
}

pub async fn run_files(config: &Config) -> Result<()> {
    let bridge = start_bridge(config).await?;
    let result = bridge.refresh_files().await;
    bridge.shutdown();

    let files = result?;
    if files.is_empty() {
        println!("No files.");
    }
    for file in files {
        println!("{}", file);
    }
    Ok(())
}

pub async fn run_get(config: &Config, path: &str) -> Result<()> {
    let bridge = start_bridge(config).await?;
    let result = bridge.get_file_contents(path).await;
    bridge.shutdown();

    print!("{}", result?);
    std::io::stdout().flush()?;
    Ok(())
}

pub async fn run_predict(config: &Config, snippet: &str, files: Vec<String>) -> Result<()> {
    let code = read_snippet(snippet)?;
    let bridge = start_bridge(config).await?;
    let loaded = load_corpus(&bridge, files).await;
    bridge.shutdown();
    loaded?;

    let results = bridge.predict_apply_destination(&code, None)?;
    print_ranked(&crate::predictor::rank(&results));
    Ok(())
}

pub async fn run_apply(
    config: &Config,
    snippet: &str,
    to: Option<String>,
    files: Vec<String>,
    yes: bool,
) -> Result<()> {
    let code = read_snippet(snippet)?;
    let bridge = start_bridge(config).await?;
    let result = apply_with(&bridge, &code, to, files, yes).await;
    bridge.shutdown();
    result
}

async fn apply_with(
    bridge: &Bridge,
    code: &str,
    to: Option<String>,
    files: Vec<String>,
    yes: bool,
) -> Result<()> {
    if let Some(file) = to {
        let outcome = bridge.apply_diff(&file, code).await?;
        println!("Applied to {}.", outcome.file);
        return Ok(());
    }

    load_corpus(bridge, files).await?;
    let outcome = if yes {
        bridge.apply_snippet(code, None, &AcceptDefault).await?
    } else {
        bridge.apply_snippet(code, None, &StdinConfirm).await?
    };

    match outcome {
        Some(outcome) => println!("Applied to {}.", outcome.file),
        None => println!("Cancelled."),
    }
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    let bridge = start_bridge(config).await?;
    let status = bridge.status();
    bridge.shutdown();

    println!("endpoint:     {}", status.endpoint);
    println!("connection:   {:?}", status.connection);
    println!("retries:      {}/{}", status.retry_count, status.max_retries);
    println!("known files:  {}", status.known_files);
    match config.state.dir.as_ref() {
        Some(dir) => println!("state dir:    {}", dir.display()),
        None => println!("state dir:    (not persisted)"),
    }
    Ok(())
}

pub async fn run_set_port(config: &Config, port: u16) -> Result<()> {
    if config.state.dir.is_none() {
        eprintln!("warning: no [state] dir configured, the port will not be remembered");
    }
    let bridge = Bridge::new(config.clone())?;
    let state = bridge.set_port(port).await;
    bridge.shutdown();

    println!("port {} saved, connection: {:?}", port, state?);
    Ok(())
}

/// Prompts on the terminal for the apply destination.
struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, proposal: &Proposal) -> Option<String> {
        println!("Apply to which file?");
        for (i, result) in proposal.ranked.iter().enumerate() {
            println!("  [{}] {:>5.1}%  {}", i + 1, result.score * 100.0, result.file_name);
        }
        let default = proposal.default.clone()?;
        print!("Number, file name, or Enter for {} ('n' to cancel): ", default);
        let _ = std::io::stdout().flush();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .ok()?
        .ok()?;

        choose(proposal, line.trim())
    }
}

fn choose(proposal: &Proposal, answer: &str) -> Option<String> {
    match answer {
        "" | "y" | "Y" => proposal.default.clone(),
        "n" | "N" => None,
        other => match other.parse::<usize>() {
            Ok(n) if n >= 1 => proposal.ranked.get(n - 1).map(|r| r.file_name.clone()),
            _ => Some(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> Proposal {
        Proposal {
            code: "let a".into(),
            ranked: vec![
                SimilarityResult {
                    file_name: "a.js".into(),
                    score: 0.9,
                },
                SimilarityResult {
                    file_name: "b.js".into(),
                    score: 0.1,
                },
            ],
            default: Some("a.js".into()),
        }
    }

    #[test]
    fn test_choose_answers() {
        let p = proposal();
        assert_eq!(choose(&p, "").as_deref(), Some("a.js"));
        assert_eq!(choose(&p, "2").as_deref(), Some("b.js"));
        assert_eq!(choose(&p, "9"), None);
        assert_eq!(choose(&p, "n"), None);
        assert_eq!(choose(&p, "src/c.js").as_deref(), Some("src/c.js"));
    }

    #[test]
    fn test_read_snippet_literal() {
        assert_eq!(read_snippet("let a = 1;").unwrap(), "let a = 1;");
    }
}
