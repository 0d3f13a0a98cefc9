//! TFRecord shard files holding `tf.train.Example` protos.
//!
//! Each record is framed as:
//!
//! ```text
//! u64 length (little endian)
//! u32 masked crc32c of the length bytes
//! [u8; length] payload
//! u32 masked crc32c of the payload
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use prost::Message;

use crate::sample::Sample;

const MASK_DELTA: u32 = 0xa282_ead8;

pub fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

#[derive(Clone, PartialEq, Message)]
pub struct Example {
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(btree_map = "string, message", tag = "1")]
    pub feature: BTreeMap<String, Feature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(oneof = "feature::Kind", tags = "2")]
    pub kind: Option<feature::Kind>,
}

pub mod feature {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

impl Example {
    /// Flattens the sample row-major into `x`, `y` and `sample_weights`.
    pub fn from_sample(sample: &Sample) -> Self {
        let mut feature = BTreeMap::new();
        feature.insert("x".to_string(), float_feature(sample.x.iter().copied().collect()));
        feature.insert("y".to_string(), float_feature(sample.y.iter().copied().collect()));
        feature.insert(
            "sample_weights".to_string(),
            float_feature(sample.sample_weights.iter().copied().collect()),
        );
        Example {
            features: Some(Features { feature }),
        }
    }

    pub fn floats(&self, key: &str) -> Option<&[f32]> {
        match self.features.as_ref()?.feature.get(key)?.kind.as_ref()? {
            feature::Kind::FloatList(list) => Some(list.value.as_slice()),
        }
    }
}

fn float_feature(value: Vec<f32>) -> Feature {
    Feature {
        kind: Some(feature::Kind::FloatList(FloatList { value })),
    }
}

/// Appends framed records to one shard file.
pub struct ShardWriter {
    path: PathBuf,
    inner: BufWriter<File>,
    records: usize,
}

impl ShardWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating shard {:?}", path))?;
        Ok(ShardWriter {
            path: path.to_path_buf(),
            inner: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u64).to_le_bytes();
        self.inner.write_all(&len)?;
        self.inner.write_all(&masked_crc(&len).to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&masked_crc(payload).to_le_bytes())?;
        self.records += 1;
        Ok(())
    }

    pub fn write_sample(&mut self, sample: &Sample) -> Result<()> {
        let payload = Example::from_sample(sample).encode_to_vec();
        self.write_record(&payload)
            .with_context(|| format!("writing record to {:?}", self.path))
    }

    /// Flushes and closes the shard.
    pub fn finish(mut self) -> Result<usize> {
        self.inner
            .flush()
            .with_context(|| format!("flushing shard {:?}", self.path))?;
        Ok(self.records)
    }
}

/// Sequential reader over a shard, verifying both checksums of every record.
pub struct ShardReader<R> {
    inner: R,
}

impl ShardReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening shard {:?}", path))?;
        Ok(ShardReader {
            inner: BufReader::new(file),
        })
    }
}

impl<R: Read> ShardReader<R> {
    pub fn new(inner: R) -> Self {
        ShardReader { inner }
    }

    /// `Ok(None)` at a clean end of file.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .context("truncated record payload")?;
        let crc = read_u32(&mut self.inner).context("truncated record checksum")?;
        if crc != masked_crc(&payload) {
            bail!("record payload checksum mismatch");
        }
        Ok(Some(payload))
    }

    pub fn read_example(&mut self) -> Result<Option<Example>> {
        match self.read_record()? {
            Some(payload) => Ok(Some(
                Example::decode(payload.as_slice()).context("decoding example")?,
            )),
            None => Ok(None),
        }
    }

    fn read_length(&mut self) -> Result<Option<u64>> {
        let mut len = [0u8; 8];
        let mut filled = 0;
        while filled < len.len() {
            match self.inner.read(&mut len[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => bail!("truncated record length"),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let crc = read_u32(&mut self.inner).context("truncated length checksum")?;
        if crc != masked_crc(&len) {
            bail!("record length checksum mismatch");
        }
        Ok(Some(u64::from_le_bytes(len)))
    }
}

impl<R: Read + Seek> ShardReader<R> {
    /// Counts records by walking the framing, skipping over payloads.
    pub fn count_records(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(len) = self.read_length()? {
            self.inner.seek(SeekFrom::Current(len as i64))?;
            read_u32(&mut self.inner).context("truncated record checksum")?;
            count += 1;
        }
        Ok(count)
    }
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn count_records(path: &Path) -> Result<usize> {
    ShardReader::open(path)?
        .count_records()
        .with_context(|| format!("scanning shard {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use std::io::Cursor;

    fn sample(seed: f32) -> Sample {
        Sample {
            x: Array3::from_shape_fn((2, 2, 3), |(a, b, c)| seed + (a * 6 + b * 3 + c) as f32),
            y: Array4::from_elem((2, 2, 2, 1), seed),
            sample_weights: Array4::from_elem((2, 2, 2, 1), 1.0),
        }
    }

    #[test]
    fn masked_crc_matches_tfrecord_reference() {
        // crc32c("") = 0, masked = MASK_DELTA
        assert_eq!(masked_crc(b""), MASK_DELTA);
        // crc32c("123456789") = 0xe3069283
        let crc: u32 = 0xe306_9283;
        assert_eq!(
            masked_crc(b"123456789"),
            ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
        );
    }

    #[test]
    fn writes_and_reads_back_examples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000000.tfrecord");
        let mut writer = ShardWriter::create(&path).unwrap();
        writer.write_sample(&sample(0.0)).unwrap();
        writer.write_sample(&sample(10.0)).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        assert_eq!(count_records(&path).unwrap(), 2);

        let mut reader = ShardReader::open(&path).unwrap();
        let first = reader.read_example().unwrap().unwrap();
        assert_eq!(first.floats("x").unwrap().len(), 12);
        assert_eq!(first.floats("x").unwrap()[5], 5.0);
        let second = reader.read_example().unwrap().unwrap();
        assert_eq!(second.floats("y").unwrap(), &[10.0; 8]);
        assert_eq!(second.floats("sample_weights").unwrap().len(), 8);
        assert!(reader.read_example().unwrap().is_none());
    }

    #[test]
    fn detects_truncation_and_corruption() {
        let mut buf = Vec::new();
        {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("shard.tfrecord");
            let mut writer = ShardWriter::create(&path).unwrap();
            writer.write_record(b"payload").unwrap();
            writer.finish().unwrap();
            buf.extend(std::fs::read(&path).unwrap());
        }

        let truncated = buf[..buf.len() - 2].to_vec();
        assert!(ShardReader::new(Cursor::new(truncated)).count_records().is_err());

        let mut corrupt = buf.clone();
        corrupt[14] ^= 0xff;
        assert!(ShardReader::new(Cursor::new(corrupt)).read_record().is_err());

        let mut reader = ShardReader::new(Cursor::new(buf));
        assert_eq!(reader.read_record().unwrap().unwrap(), b"payload");
    }
}
