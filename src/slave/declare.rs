//! Slave declaration parsing.
//!
//! A slave list is a comma-separated sequence of `host[:slots[:port]]`
//! entries. The same grammar is accepted from the `--distributed=` option,
//! the project's remote slaves attribute (one entry per element) and the
//! `DISTBUILD_SLAVES` environment variable.

use std::collections::HashSet;

use crate::config::SessionConfig;
use crate::error::DeclarationError;

/// Prefix of the command-line option carrying a slave list.
pub const DISTRIBUTED_OPTION: &str = "--distributed=";

/// One declared slave, not yet connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveDecl {
    pub host: String,
    pub slots: usize,
    pub port: u16,
}

/// Value of a `--distributed=` argument, if `arg` is one.
pub fn distributed_option(arg: &str) -> Option<&str> {
    arg.strip_prefix(DISTRIBUTED_OPTION)
}

/// Parse a comma-separated slave list.
pub fn parse_slave_list(
    list: &str,
    config: &SessionConfig,
) -> Result<Vec<SlaveDecl>, DeclarationError> {
    if list.trim().is_empty() {
        return Err(DeclarationError::Empty);
    }
    let entries = list
        .split(',')
        .map(|entry| {
            if entry.trim().is_empty() {
                Err(DeclarationError::EmptyEntry {
                    list: list.to_string(),
                })
            } else {
                parse_slave_entry(entry, config)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_unique(&entries)?;
    Ok(entries)
}

/// Parse the list form used by the project attribute: one entry per element.
pub fn parse_slave_attribute<S: AsRef<str>>(
    values: &[S],
    config: &SessionConfig,
) -> Result<Vec<SlaveDecl>, DeclarationError> {
    if values.is_empty() {
        return Err(DeclarationError::Empty);
    }
    let entries = values
        .iter()
        .map(|v| parse_slave_entry(v.as_ref(), config))
        .collect::<Result<Vec<_>, _>>()?;
    check_unique(&entries)?;
    Ok(entries)
}

/// Parse a single `host[:slots[:port]]` entry.
pub fn parse_slave_entry(
    entry: &str,
    config: &SessionConfig,
) -> Result<SlaveDecl, DeclarationError> {
    let trimmed = entry.trim();
    let mut fields = trimmed.split(':');

    let host = fields.next().unwrap_or_default().trim();
    if host.is_empty() {
        return Err(DeclarationError::MissingHost {
            entry: trimmed.to_string(),
        });
    }

    let slots = match fields.next() {
        None => config.default_slots,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(DeclarationError::InvalidSlots {
                    entry: trimmed.to_string(),
                    value: raw.to_string(),
                });
            }
        },
    };

    let port = match fields.next() {
        None => config.default_port,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => {
                return Err(DeclarationError::InvalidPort {
                    entry: trimmed.to_string(),
                    value: raw.to_string(),
                });
            }
        },
    };

    if fields.next().is_some() {
        return Err(DeclarationError::TooManyFields {
            entry: trimmed.to_string(),
        });
    }

    Ok(SlaveDecl {
        host: host.to_string(),
        slots,
        port,
    })
}

fn check_unique(entries: &[SlaveDecl]) -> Result<(), DeclarationError> {
    let mut seen = HashSet::new();
    for decl in entries {
        if !seen.insert(decl.host.as_str()) {
            return Err(DeclarationError::DuplicateHost {
                host: decl.host.clone(),
            });
        }
    }
    Ok(())
}
