// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// CLI flags (clap) plus a hand-rolled parser for the daemon's bespoke
// line-oriented config grammar. The grammar predates this crate and is
// not expressible as TOML/YAML without breaking on-disk compatibility,
// so it gets its own small parser rather than a generic format.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::LcapError;

/// Public broker endpoint, bound by the daemon and dialed by readers and
/// consumers alike.
pub const BROKER_BIND_ENDPOINT: &str = "tcp://*:8189";
pub const BROKER_CONNECT_ENDPOINT: &str = "tcp://localhost:8189";

pub const MAX_MDT: usize = 128;
pub const DEFAULT_CFG_FILE: &str = "/etc/lcap.cfg";
pub const DEFAULT_REC_BATCH: u32 = 64;
pub const DEFAULT_MAX_BUCKETS: usize = 64;

/// `lcapd` command-line flags, matching the original daemon's `-c/-o/-v/-h`.
#[derive(Parser, Debug)]
#[command(name = "lcapd", about = "Changelog aggregation and publication daemon")]
pub struct Cli {
    /// Alternative configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Exit at changelog EOF
    #[arg(short = 'o')]
    pub oneshot: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// Fully resolved daemon configuration: CLI flags layered over config-file
/// directives, with the config file's defaults applied first.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub config_path: PathBuf,
    pub mdt: Vec<String>,
    pub rec_batch_count: u32,
    pub max_buckets: usize,
    pub worker_count: Option<u32>,
    pub oneshot: bool,
    pub verbosity: u8,
    pub module_name: Option<String>,
    pub logger_name: Option<String>,
    pub clreader: Option<String>,
}

impl Configuration {
    pub fn from_cli(cli: &Cli) -> Result<Configuration, LcapError> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CFG_FILE));
        let text = fs::read_to_string(&path).map_err(|e| {
            LcapError::Fatal(format!("can't read config file {}: {e}", path.display()))
        })?;
        let mut cfg = Configuration {
            config_path: path,
            mdt: Vec::new(),
            rec_batch_count: DEFAULT_REC_BATCH,
            max_buckets: DEFAULT_MAX_BUCKETS,
            worker_count: None,
            oneshot: cli.oneshot,
            verbosity: cli.verbosity,
            module_name: None,
            logger_name: None,
            clreader: None,
        };
        parse_directives(&text, &mut cfg)?;
        Ok(cfg)
    }

    #[cfg(test)]
    pub fn from_str_for_test(text: &str) -> Result<Configuration, LcapError> {
        let mut cfg = Configuration {
            config_path: PathBuf::from("<test>"),
            mdt: Vec::new(),
            rec_batch_count: DEFAULT_REC_BATCH,
            max_buckets: DEFAULT_MAX_BUCKETS,
            worker_count: None,
            oneshot: false,
            verbosity: 0,
            module_name: None,
            logger_name: None,
            clreader: None,
        };
        parse_directives(text, &mut cfg)?;
        Ok(cfg)
    }
}

fn cfg_get_arg(line: &str) -> Option<&str> {
    line.split_whitespace().nth(1)
}

fn parse_directives(text: &str, cfg: &mut Configuration) -> Result<(), LcapError> {
    for raw_line in text.lines() {
        let line = raw_line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let directive = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match directive.as_str() {
            "loadmodule" => {
                if cfg.module_name.is_some() {
                    return Err(LcapError::AlreadyExists("loadmodule".into()));
                }
                cfg.module_name = Some(require_arg(line, "module name")?.to_owned());
            }
            "batch_records" => {
                let arg = require_arg(line, "batch_records count")?;
                cfg.rec_batch_count = arg
                    .parse()
                    .map_err(|_| LcapError::InvalidArgument(format!("bad batch_records: {arg}")))?;
            }
            "logtype" => {
                if cfg.logger_name.is_some() {
                    return Err(LcapError::AlreadyExists("logtype".into()));
                }
                cfg.logger_name = Some(require_arg(line, "logger type")?.to_owned());
            }
            "workers" => {
                if cfg.worker_count.is_some() {
                    return Err(LcapError::AlreadyExists("workers".into()));
                }
                let arg = require_arg(line, "worker count")?;
                cfg.worker_count = Some(
                    arg.parse()
                        .map_err(|_| LcapError::InvalidArgument(format!("bad workers: {arg}")))?,
                );
            }
            "mdtdevice" => {
                if cfg.mdt.len() >= MAX_MDT {
                    return Err(LcapError::AlreadyExists(format!(
                        "max # of MDT devices reached ({MAX_MDT})"
                    )));
                }
                cfg.mdt.push(require_arg(line, "MDT device name")?.to_owned());
            }
            "clreader" => {
                if cfg.clreader.is_some() {
                    return Err(LcapError::AlreadyExists("clreader".into()));
                }
                cfg.clreader = Some(require_arg(line, "CL reader index")?.to_owned());
            }
            other => {
                return Err(LcapError::InvalidArgument(format!(
                    "unknown configuration statement: {other}"
                )));
            }
        }
    }
    Ok(())
}

fn require_arg<'a>(line: &'a str, what: &str) -> Result<&'a str, LcapError> {
    cfg_get_arg(line).ok_or_else(|| LcapError::InvalidArgument(format!("missing parameter: {what}")))
}

/// Resolve the config's verbosity into an `env_logger` filter, `-v` raising
/// the floor relative to whatever `RUST_LOG` would otherwise select.
pub fn verbosity_to_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

pub fn default_config_path() -> &'static Path {
    Path::new(DEFAULT_CFG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_directives() {
        let cfg = Configuration::from_str_for_test(
            "# comment\nbatch_records 4\nmdtdevice mdt0\nmdtdevice mdt1\nworkers 2\n",
        )
        .unwrap();
        assert_eq!(cfg.rec_batch_count, 4);
        assert_eq!(cfg.mdt, vec!["mdt0", "mdt1"]);
        assert_eq!(cfg.worker_count, Some(2));
    }

    #[test]
    fn rejects_duplicate_directive() {
        let err = Configuration::from_str_for_test("workers 1\nworkers 2\n").unwrap_err();
        assert!(matches!(err, LcapError::AlreadyExists(_)));
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = Configuration::from_str_for_test("bogus thing\n").unwrap_err();
        assert!(matches!(err, LcapError::InvalidArgument(_)));
    }

    #[test]
    fn enforces_max_mdt_count() {
        let mut text = String::new();
        for i in 0..MAX_MDT + 1 {
            text.push_str(&format!("mdtdevice mdt{i}\n"));
        }
        let err = Configuration::from_str_for_test(&text).unwrap_err();
        assert!(matches!(err, LcapError::AlreadyExists(_)));
    }

    #[test]
    fn case_insensitive_directive_names() {
        let cfg = Configuration::from_str_for_test("BATCH_RECORDS 9\n").unwrap();
        assert_eq!(cfg.rec_batch_count, 9);
    }
}
