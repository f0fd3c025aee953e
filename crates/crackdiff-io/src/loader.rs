//! Fetch and decode source images.
//!
//! An [`ImageFetcher`] turns a source reference (a path, URL or key) into
//! encoded bytes; [`load`] decodes them into an RGBA buffer. Nothing is
//! cached here and failed fetches are not retried.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use crackdiff_pipeline::{PipelineError, RgbaImage};

/// Errors that can occur while loading a source image.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The source could not be reached or read.
    #[error("failed to fetch {reference}: {message}")]
    Network {
        /// The source reference that was requested.
        reference: String,
        /// What went wrong.
        message: String,
    },

    /// The source returned no bytes.
    #[error("{reference} is empty")]
    Empty {
        /// The source reference that was requested.
        reference: String,
    },

    /// The bytes are not a supported image.
    #[error("failed to decode {reference}: {error}")]
    Decode {
        /// The source reference that was requested.
        reference: String,
        /// The decoder's complaint.
        error: PipelineError,
    },

    /// The decoding task panicked or was shut down.
    #[error("decoding {reference} did not finish: {message}")]
    Interrupted {
        /// The source reference that was requested.
        reference: String,
        /// Why the task stopped.
        message: String,
    },
}

/// Produces encoded image bytes for a source reference.
pub trait ImageFetcher: Send + Sync {
    /// Fetch the bytes behind `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Network`] when the source cannot be reached.
    fn fetch(&self, reference: &str) -> impl Future<Output = Result<Vec<u8>, LoadError>> + Send;
}

/// Reads files, optionally relative to a root directory.
#[derive(Debug, Clone, Default)]
pub struct FsFetcher {
    root: Option<PathBuf>,
}

impl FsFetcher {
    /// Resolve references as given.
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Resolve references relative to `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl ImageFetcher for FsFetcher {
    fn fetch(&self, reference: &str) -> impl Future<Output = Result<Vec<u8>, LoadError>> + Send {
        let path = self
            .root
            .as_ref()
            .map_or_else(|| PathBuf::from(reference), |root| root.join(reference));
        let reference = reference.to_owned();
        async move {
            tokio::fs::read(&path).await.map_err(|e| LoadError::Network {
                reference,
                message: e.to_string(),
            })
        }
    }
}

/// Serves images from an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    images: HashMap<String, Vec<u8>>,
}

impl MemoryFetcher {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` under `reference`, replacing any previous entry.
    pub fn insert(&mut self, reference: impl Into<String>, bytes: Vec<u8>) {
        self.images.insert(reference.into(), bytes);
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, reference: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(reference, bytes);
        self
    }
}

impl ImageFetcher for MemoryFetcher {
    fn fetch(&self, reference: &str) -> impl Future<Output = Result<Vec<u8>, LoadError>> + Send {
        let result = self
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| LoadError::Network {
                reference: reference.to_owned(),
                message: "no such image".to_owned(),
            });
        std::future::ready(result)
    }
}

/// Fetches over HTTP(S).
///
/// The client has no cookie store and never adds authorization headers,
/// so only publicly reachable images can be loaded.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// User agent sent with every request.
    pub const USER_AGENT: &'static str = concat!("crackdiff/", env!("CARGO_PKG_VERSION"));

    /// Build a fetcher with a fresh client.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Network`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, LoadError> {
        let client = reqwest::Client::builder()
            .user_agent(Self::USER_AGENT)
            .build()
            .map_err(|e| LoadError::Network {
                reference: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, reference: &str) -> impl Future<Output = Result<Vec<u8>, LoadError>> + Send {
        let request = self.client.get(reference);
        let reference = reference.to_owned();
        async move {
            let network = |e: reqwest::Error| LoadError::Network {
                reference: reference.clone(),
                message: e.to_string(),
            };
            let response = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(network)?;
            let bytes = response.bytes().await.map_err(network)?;
            Ok(bytes.to_vec())
        }
    }
}

/// Fetch and decode one image.
///
/// Decoding runs on tokio's blocking pool so other tasks keep running.
///
/// # Errors
///
/// Returns [`LoadError::Network`] if the fetch fails,
/// [`LoadError::Empty`] for zero bytes and [`LoadError::Decode`] for
/// anything the decoder rejects. [`LoadError::Interrupted`] means the
/// decoding task itself failed.
pub async fn load<F: ImageFetcher>(
    fetcher: &F,
    reference: &str,
) -> Result<RgbaImage, LoadError> {
    let bytes = fetcher.fetch(reference).await?;
    if bytes.is_empty() {
        return Err(LoadError::Empty {
            reference: reference.to_owned(),
        });
    }
    let decoded = tokio::task::spawn_blocking(move || crackdiff_pipeline::grayscale::decode(&bytes))
        .await
        .map_err(|e| LoadError::Interrupted {
            reference: reference.to_owned(),
            message: e.to_string(),
        })?;
    let image = decoded.map_err(|error| match error {
        PipelineError::EmptyInput => LoadError::Empty {
            reference: reference.to_owned(),
        },
        error => LoadError::Decode {
            reference: reference.to_owned(),
            error,
        },
    })?;
    tracing::debug!(reference, width = image.width(), height = image.height(), "image loaded");
    Ok(image)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::Rgba;

    use super::*;
    use crate::raster::encode_png;

    fn png(w: u32, h: u32) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255]))).unwrap()
    }

    #[tokio::test]
    async fn memory_fetcher_loads_registered_image() {
        let fetcher = MemoryFetcher::new().with("a", png(4, 3));
        let image = load(&fetcher, "a").await.unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(0, 0).0, [10, 20, 30, 255]);
    }

    #[tokio::test]
    async fn unknown_reference_is_a_network_error() {
        let fetcher = MemoryFetcher::new();
        let err = load(&fetcher, "missing").await.unwrap_err();
        assert!(matches!(err, LoadError::Network { ref reference, .. } if reference == "missing"));
    }

    #[tokio::test]
    async fn empty_bytes_are_rejected() {
        let fetcher = MemoryFetcher::new().with("e", Vec::new());
        assert!(matches!(
            load(&fetcher, "e").await,
            Err(LoadError::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_bytes_fail_to_decode() {
        let fetcher = MemoryFetcher::new().with("g", vec![1, 2, 3, 4, 5]);
        assert!(matches!(
            load(&fetcher, "g").await,
            Err(LoadError::Decode { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn decoding_leaves_the_executor_free() {
        let fetcher = MemoryFetcher::new().with("big", png(1500, 1500));
        let polls = Arc::new(AtomicUsize::new(0));
        let other = {
            let polls = Arc::clone(&polls);
            tokio::spawn(async move {
                loop {
                    polls.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        };

        // Nothing yields before the decode, so the other task only runs
        // if the decode is off this thread.
        let image = load(&fetcher, "big").await.unwrap();
        other.abort();
        assert_eq!(image.dimensions(), (1500, 1500));
        assert!(polls.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn fs_fetcher_reads_relative_to_root() {
        let dir = std::env::temp_dir().join(format!("crackdiff-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("img.png"), png(2, 2)).unwrap();

        let fetcher = FsFetcher::with_root(&dir);
        let image = load(&fetcher, "img.png").await.unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert!(matches!(
            load(&fetcher, "nope.png").await,
            Err(LoadError::Network { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn http_fetcher_rejects_malformed_url() {
        let fetcher = HttpFetcher::new().unwrap();
        assert!(matches!(
            fetcher.fetch("not a url").await,
            Err(LoadError::Network { .. })
        ));
    }
}
