//! Common utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use image_analyzer::error::{PullError, Result};
use image_analyzer::metadata::{ordered_layers, ImageConfig, LayerDescriptor, OCI_LAYER_GZIP};
use image_analyzer::progress::{ProgressEvent, ProgressKind, ProgressSender};
use image_analyzer::sources::{ImageSource, ResolvedImage};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;
use tar_rs as tar;

/// One entry of a synthetic layer.
pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a str),
    /// Name written verbatim, bypassing the builder's own path checks.
    RawFile(&'a str, &'a str),
}

/// Builds a gzip-compressed tar layer in memory.
pub fn gz_layer(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        match entry {
            Entry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, path, std::io::empty()).unwrap();
            }
            Entry::File(path, content) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
                builder
                    .append_data(&mut header, path, content.as_bytes())
                    .unwrap();
            }
            Entry::RawFile(path, content) => {
                header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
                header.set_cksum();
                builder.append(&header, content.as_bytes()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

pub fn image_config(arch: &str) -> ImageConfig {
    ImageConfig {
        architecture: arch.to_string(),
        os: "linux".to_string(),
        env: vec!["PATH=/usr/local/bin:/usr/bin".to_string()],
    }
}

#[derive(Clone)]
struct FakeImage {
    config: ImageConfig,
    layers: Vec<(LayerDescriptor, Vec<u8>)>,
}

/// In-memory image source. Unknown references fail to resolve.
#[derive(Default)]
pub struct FakeSource {
    images: HashMap<String, FakeImage>,
    fetch_delay: Option<Duration>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, reference: &str, config: ImageConfig, blobs: Vec<Vec<u8>>) -> Self {
        let descriptors = ordered_layers(blobs.iter().map(|blob| {
            (
                sha256_digest(blob),
                blob.len() as u64,
                OCI_LAYER_GZIP.to_string(),
            )
        }));
        let layers = descriptors.into_iter().zip(blobs).collect();
        self.images
            .insert(reference.to_string(), FakeImage { config, layers });
        self
    }

    /// Makes every blob fetch wait this long first.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }
}

#[async_trait]
impl ImageSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn resolve(&self, reference: &str) -> Result<ResolvedImage> {
        let image = self
            .images
            .get(reference)
            .ok_or_else(|| PullError::resolution(reference, "manifest unknown"))?;
        Ok(ResolvedImage {
            reference: reference.to_string(),
            manifest_digest: None,
            config: image.config.clone(),
            layers: image.layers.iter().map(|(d, _)| d.clone()).collect(),
        })
    }

    async fn fetch_blob(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        progress.send(ProgressEvent::new(ProgressKind::NewArtifact, &layer.digest));
        let data = self
            .images
            .get(&image.reference)
            .and_then(|img| img.layers.iter().find(|(d, _)| d.ordinal == layer.ordinal))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| PullError::fetch(&layer.digest, "blob unknown"))?;
        progress.send(ProgressEvent::new(ProgressKind::Done, &layer.digest));
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Number of entries directly inside `dir`.
pub fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
}

fn write_blob(dir: &Path, data: &[u8]) -> String {
    let digest = sha256_digest(data);
    let blobs = dir.join("blobs/sha256");
    fs::create_dir_all(&blobs).unwrap();
    fs::write(blobs.join(digest.trim_start_matches("sha256:")), data).unwrap();
    digest
}

/// Writes an OCI image layout with one manifest to `dir`.
pub fn write_layout(dir: &Path, config_json: &str, layers: &[Vec<u8>]) {
    let config_digest = write_blob(dir, config_json.as_bytes());
    let layer_json: Vec<String> = layers
        .iter()
        .map(|layer| {
            format!(
                r#"{{"mediaType":"{}","digest":"{}","size":{}}}"#,
                OCI_LAYER_GZIP,
                write_blob(dir, layer),
                layer.len()
            )
        })
        .collect();
    let manifest = format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{}","size":{}}},"layers":[{}]}}"#,
        config_digest,
        config_json.len(),
        layer_json.join(",")
    );
    let manifest_digest = write_blob(dir, manifest.as_bytes());
    let index = format!(
        r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"{}","size":{}}}]}}"#,
        manifest_digest,
        manifest.len()
    );
    fs::write(dir.join("index.json"), index).unwrap();
    fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
}

/// The two-layer image used by the end-to-end checks.
pub fn two_layer_image() -> Vec<Vec<u8>> {
    vec![
        gz_layer(&[Entry::Dir("etc/"), Entry::File("etc/os-release", "NAME=Test\n")]),
        gz_layer(&[
            Entry::File("usr/bin/curl", ""),
            Entry::Dir("usr/lib/python3/site-packages/foo-1.0.dist-info/"),
        ]),
    ]
}
