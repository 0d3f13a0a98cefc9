//! Channel layout derived from the loader configuration.
//!
//! Channel order decides which input-tensor columns a variable occupies, so
//! it has to be identical on every build and on every worker. Sources and
//! variables are therefore always walked in sorted order and the result is
//! kept as an explicit `Vec<Channel>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::LoaderConfig;
use crate::error::ConfigError;

/// Static variables encoded as a day-of-year cycle rather than a spatial field.
const CYCLICAL_META: [&str; 2] = ["sin", "cos"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Abs,
    Anom,
}

impl DataFormat {
    pub const ALL: [DataFormat; 2] = [DataFormat::Abs, DataFormat::Anom];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Abs => "abs",
            DataFormat::Anom => "anom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// Looked up by month/day in a reference year and broadcast over the grid.
    Cyclical,
    /// Copied from a static `(rows, cols)` field.
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// `width` daily planes going back from the forecast date.
    Lagged(DataFormat),
    /// One plane per forward day offset in `steps`.
    LinearTrend { steps: Vec<i64> },
    /// A single non-temporal plane.
    Meta(MetaKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub width: usize,
    pub kind: ChannelKind,
    pub files: Vec<PathBuf>,
}

impl Channel {
    /// Backing file used for generation; `None` means the channel has no data.
    pub fn file(&self) -> Option<&Path> {
        self.files.first().map(|p| p.as_path())
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.kind, ChannelKind::Meta(_))
    }

    pub fn is_trend(&self) -> bool {
        matches!(self.kind, ChannelKind::LinearTrend { .. })
    }

    pub fn is_lagged(&self) -> bool {
        matches!(self.kind, ChannelKind::Lagged(_))
    }

    /// Per-plane labels, `name_1 ..= name_width`.
    pub fn labels(&self) -> impl Iterator<Item = String> + '_ {
        (1..=self.width).map(move |i| format!("{}_{}", self.name, i))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    channels: Vec<Channel>,
}

impl ChannelLayout {
    /// Lagged channels first (abs then anom), then linear trends, then meta.
    pub fn build(
        config: &LoaderConfig,
        var_lag: usize,
        var_lag_override: &BTreeMap<String, usize>,
    ) -> Result<Self, ConfigError> {
        let mut layout = ChannelLayout {
            channels: Vec::new(),
        };

        // BTreeMap iteration is already sorted by identity.
        for format in DataFormat::ALL {
            for (identity, source) in &config.sources {
                let mut vars: Vec<&String> = match format {
                    DataFormat::Abs => source.abs.iter().collect(),
                    DataFormat::Anom => source.anom.iter().collect(),
                };
                vars.sort();

                for var in vars {
                    let name = format!("{}_{}", var, format.as_str());
                    let width = var_lag_override.get(var).copied().unwrap_or(var_lag);
                    let files = matching_files(source.var_files.get(var), &name);
                    layout.push(
                        identity,
                        Channel {
                            name,
                            width,
                            kind: ChannelKind::Lagged(format),
                            files,
                        },
                    )?;
                }
            }
        }

        for (identity, source) in &config.sources {
            let mut vars: Vec<&String> = source.linear_trends.iter().collect();
            vars.sort();
            let steps = source.linear_trend_steps.offsets();

            for var in vars {
                let name = format!("{}_linear_trend", var);
                if steps.is_empty() {
                    warn!("No linear trend steps configured for {}", name);
                }
                let files = matching_files(source.var_files.get(var), &name);
                layout.push(
                    identity,
                    Channel {
                        name,
                        width: steps.len(),
                        kind: ChannelKind::LinearTrend {
                            steps: steps.clone(),
                        },
                        files,
                    },
                )?;
            }
        }

        for (identity, source) in &config.sources {
            let mut vars: Vec<&String> = source.meta.iter().collect();
            vars.sort();

            for var in vars {
                if let Some(requested) = var_lag_override.get(var) {
                    if *requested > 1 {
                        return Err(ConfigError::MetaWidth(var.clone()));
                    }
                }
                let kind = if CYCLICAL_META.contains(&var.as_str()) {
                    MetaKind::Cyclical
                } else {
                    MetaKind::Field
                };
                let files = matching_files(source.var_files.get(var), var);
                layout.push(
                    identity,
                    Channel {
                        name: var.clone(),
                        width: 1,
                        kind: ChannelKind::Meta(kind),
                        files,
                    },
                )?;
            }
        }

        debug!(
            "Channel quantities deduced: {:?}, total channels: {}",
            layout.widths(),
            layout.num_channels()
        );
        Ok(layout)
    }

    fn push(&mut self, identity: &str, channel: Channel) -> Result<(), ConfigError> {
        if channel.files.len() > 1 {
            warn!(
                "Multiple files found for {}, only using {:?}",
                channel.name, channel.files[0]
            );
        } else if channel.files.is_empty() {
            warn!(
                "No files in channel list for {} (source {}), it will be zero-filled",
                channel.name, identity
            );
        }

        match self.channels.iter_mut().find(|c| c.name == channel.name) {
            None => {
                debug!("Adding {} files to {} channel", channel.files.len(), channel.name);
                self.channels.push(channel);
            }
            Some(existing) => {
                if existing.width != channel.width {
                    return Err(ConfigError::ConflictingWidth {
                        channel: channel.name,
                        first: existing.width,
                        second: channel.width,
                    });
                }
                if existing.file() != channel.file() {
                    return Err(ConfigError::AmbiguousFiles {
                        first: existing.file().map(Path::to_path_buf),
                        second: channel.file().map(Path::to_path_buf),
                        channel: channel.name,
                    });
                }
                warn!(
                    "{} already has files, but more found in source {}, \
                     this could be an unintentional merge of sources",
                    channel.name, identity
                );
                for file in channel.files {
                    if !existing.files.contains(&file) {
                        existing.files.push(file);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.iter().map(|c| c.width).sum()
    }

    /// Ordered `(name, width)` pairs.
    pub fn widths(&self) -> Vec<(&str, usize)> {
        self.channels
            .iter()
            .map(|c| (c.name.as_str(), c.width))
            .collect()
    }

    /// One label per scalar plane, in input-tensor column order.
    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().flat_map(|c| c.labels()).collect()
    }

    pub fn meta_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_meta())
    }
}

fn matching_files(candidates: Option<&Vec<PathBuf>>, token: &str) -> Vec<PathBuf> {
    candidates
        .map(|files| {
            files
                .iter()
                .filter(|f| {
                    f.file_name()
                        .map(|n| n.to_string_lossy().contains(token))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
