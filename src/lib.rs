//! Sample generation for daily gridded sea-ice forecasting datasets.
//!
//! A [`loader::DataLoader`] turns a loader configuration into a
//! [`channels::ChannelLayout`], assembles `(x, y, sample_weights)` triples per
//! forecast date and writes them in batches as TFRecord shards, finishing with
//! a [`manifest::DatasetManifest`] describing the result.

pub mod batch;
pub mod channels;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod masks;
pub mod pool;
pub mod record;
pub mod sample;

pub use channels::{Channel, ChannelKind, ChannelLayout};
pub use config::{DatePolicy, Hemisphere, LoaderConfig, Split, SplitDates};
pub use error::{ConfigError, SampleError};
pub use loader::{DataLoader, GenerationSummary, LoaderOptions};
pub use manifest::{DatasetManifest, LoaderPath, SplitCounts};
pub use masks::{MaskProvider, MaskStack, NpyMasks};
pub use pool::WorkerPool;
pub use sample::{Sample, SampleParams};
