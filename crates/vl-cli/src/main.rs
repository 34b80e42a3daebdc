#![warn(missing_docs)]

//! vlsandbox command-line runner
//!
//! Screens a script, applies the configured exposures, runs it once and prints
//! the resulting scope as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use vl_config::VlConfig;
use vl_sandbox::{Sandbox, SandboxConfig};

#[derive(Parser, Debug)]
#[command(
    name = "vlsandbox",
    version,
    about = "Run an untrusted JavaScript snippet against a whitelist of globals"
)]
struct Cli {
    /// Script to run.
    script: PathBuf,

    /// Config file; defaults to $VLSANDBOX_CONFIG, then ./vlsandbox.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Expose an ambient global under its own name. Repeatable.
    #[arg(short, long = "expose", value_name = "NAME")]
    expose: Vec<String>,

    /// Bind NAME to a JSON value. Repeatable.
    #[arg(short, long = "set", value_name = "NAME=JSON", value_parser = parse_assignment)]
    set: Vec<(String, Value)>,

    /// Initial scope object, available to the script as `this`.
    #[arg(long, value_name = "JSON", value_parser = parse_scope)]
    scope: Option<Map<String, Value>>,

    /// Accept `function*` generators.
    #[arg(long)]
    allow_generators: bool,

    /// Terminate the run after this many milliseconds.
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,
}

fn parse_assignment(arg: &str) -> Result<(String, Value), String> {
    let (name, json) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got '{arg}'"))?;
    let value = serde_json::from_str(json).map_err(|e| format!("invalid JSON for '{name}': {e}"))?;
    Ok((name.to_string(), value))
}

fn parse_scope(arg: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(arg) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("scope must be a JSON object".into()),
        Err(e) => Err(format!("invalid scope JSON: {e}")),
    }
}

/// Build SandboxConfig from config overrides and command-line flags.
fn build_sandbox_config(
    overrides: &vl_config::SandboxOverrides,
    cli: &Cli,
) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(allow) = overrides.allow_generator_functions {
        config.allow_generator_functions = allow;
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap
            .checked_mul(1024 * 1024)
            .with_context(|| format!("sandbox.max_heap_mb = {heap} does not fit in memory"))?;
    }
    if let Some(ms) = overrides.timeout_ms {
        config.timeout = Some(Duration::from_millis(ms));
    }
    config.prelude = overrides.prelude.clone();

    if cli.allow_generators {
        config.allow_generator_functions = true;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout = Some(Duration::from_millis(ms));
    }
    Ok(config)
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config`
/// 2. `VLSANDBOX_CONFIG` environment variable
/// 3. `./vlsandbox.toml` in the current directory
/// 4. None (running without a config file is fine)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("VLSANDBOX_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("vlsandbox.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Apply file exposures, then command-line ones, so flags win on conflict.
fn apply_exposures(sandbox: &mut Sandbox, config: &VlConfig, cli: &Cli) -> Result<()> {
    let expose = &config.expose;
    for name in &expose.ambient {
        expose_ambient(sandbox, name)?;
    }
    for (name, value) in &expose.values {
        sandbox.expose_value(name, value.clone())?;
    }
    for name in &expose.undefined {
        sandbox.expose_undefined(name)?;
    }
    if let Some(name) = &expose.logger {
        sandbox.expose_logger(name)?;
    }

    for name in &cli.expose {
        expose_ambient(sandbox, name)?;
    }
    for (name, value) in &cli.set {
        sandbox.expose_value(name, value.clone())?;
    }
    Ok(())
}

fn expose_ambient(sandbox: &mut Sandbox, name: &str) -> Result<()> {
    sandbox
        .expose_ambient(name)
        .with_context(|| format!("cannot expose '{name}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match find_config_file(cli.config.as_deref()) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            VlConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            VlConfig::default()
        }
    };

    let source = std::fs::read_to_string(&cli.script)
        .with_context(|| format!("failed to read {}", cli.script.display()))?;

    let sandbox_config = build_sandbox_config(&config.sandbox, &cli)?;
    let mut sandbox = Sandbox::with_config(source, sandbox_config)
        .with_context(|| format!("{} was rejected", cli.script.display()))?;

    apply_exposures(&mut sandbox, &config, &cli)?;

    let mut scope = cli.scope.clone().unwrap_or_default();
    sandbox
        .run(Some(&mut scope))
        .with_context(|| format!("{} failed", cli.script.display()))?;

    println!("{}", serde_json::to_string_pretty(&scope)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vlsandbox").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parses_repeated_flags() {
        let cli = cli(&[
            "snippet.js",
            "--expose",
            "Math",
            "-e",
            "JSON",
            "--set",
            "limit=10",
            "--set",
            r#"user={"name":"ada"}"#,
            "--scope",
            r#"{"a":1}"#,
        ]);
        assert_eq!(cli.script, PathBuf::from("snippet.js"));
        assert_eq!(cli.expose, vec!["Math", "JSON"]);
        assert_eq!(cli.set[0], ("limit".into(), serde_json::json!(10)));
        assert_eq!(cli.set[1].1, serde_json::json!({"name": "ada"}));
        assert_eq!(cli.scope.unwrap()["a"], 1);
    }

    #[test]
    fn assignment_requires_equals_and_json() {
        assert!(parse_assignment("limit").is_err());
        assert!(parse_assignment("limit=not json").is_err());
        assert_eq!(
            parse_assignment("s=\"a=b\"").unwrap(),
            ("s".into(), serde_json::json!("a=b"))
        );
    }

    #[test]
    fn scope_must_be_an_object() {
        assert!(parse_scope("[1, 2]").is_err());
        assert!(parse_scope("{").is_err());
        assert!(parse_scope("{}").unwrap().is_empty());
    }

    #[test]
    fn flags_override_file_settings() {
        let config = VlConfig::from_toml(
            r#"
            [sandbox]
            allow_generator_functions = false
            max_heap_mb = 32
            timeout_ms = 1000
            "#,
        )
        .unwrap();
        let cli = cli(&["s.js", "--allow-generators", "--timeout-ms", "50"]);

        let sandbox_config = build_sandbox_config(&config.sandbox, &cli).unwrap();
        assert!(sandbox_config.allow_generator_functions);
        assert_eq!(sandbox_config.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(sandbox_config.timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn defaults_without_config() {
        let cli = cli(&["s.js"]);
        let sandbox_config = build_sandbox_config(&Default::default(), &cli).unwrap();
        assert!(!sandbox_config.allow_generator_functions);
        assert!(sandbox_config.timeout.is_none());
        assert!(sandbox_config.prelude.is_none());
    }

    #[test]
    fn oversized_heap_is_an_error() {
        let overrides = vl_config::SandboxOverrides {
            max_heap_mb: Some(usize::MAX),
            ..Default::default()
        };
        let err = build_sandbox_config(&overrides, &cli(&["s.js"])).unwrap_err();
        assert!(err.to_string().contains("max_heap_mb"), "got: {err}");
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = Path::new("/tmp/explicit-vlsandbox.toml");
        assert_eq!(find_config_file(Some(path)), Some(path.to_path_buf()));
    }
}
