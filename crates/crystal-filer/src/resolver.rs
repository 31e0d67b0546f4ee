use std::collections::HashMap;
use std::sync::Arc;

use crystal_types::{CrystalError, CrystalResult, FilerConfiguration};

use crate::bucket::{BucketClient, BucketFiler};
use crate::local::LocalFiler;
use crate::traits::RawFiler;

/// Turns filer configurations into filer handles.
///
/// Local directories need nothing extra. Remote buckets resolve through the
/// client registered under the bucket's name.
#[derive(Clone, Debug, Default)]
pub struct FilerResolver {
    buckets: HashMap<String, Arc<dyn BucketClient>>,
}

impl FilerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client serving `bucket`.
    pub fn register_bucket(&mut self, bucket: impl Into<String>, client: Arc<dyn BucketClient>) {
        self.buckets.insert(bucket.into(), client);
    }

    /// Open the filer described by `config`.
    ///
    /// `Empty` configurations and buckets without a registered client yield
    /// `CrystalError::NoFiler`.
    pub fn resolve(&self, config: &FilerConfiguration) -> CrystalResult<Arc<dyn RawFiler>> {
        match config {
            FilerConfiguration::Empty => Err(CrystalError::NoFiler),
            FilerConfiguration::LocalDirectory { path, .. } => {
                Ok(Arc::new(LocalFiler::new(path.clone())))
            }
            FilerConfiguration::RemoteBucket { bucket, path, .. } => {
                let client = self.buckets.get(bucket).ok_or(CrystalError::NoFiler)?;
                Ok(Arc::new(BucketFiler::new(client.clone(), bucket.clone(), path)))
            }
        }
    }
}
