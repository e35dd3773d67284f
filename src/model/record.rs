//! Conversion between burn modules/records and opaque byte blobs.

use anyhow::{anyhow, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};
use burn::tensor::backend::Backend;

type BytesRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Serialize any burn record
pub fn record_to_bytes<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    Recorder::<B>::record(&BytesRecorder::default(), record, ())
        .map_err(|e| anyhow!("Failed to serialize record: {:?}", e))
}

/// Deserialize a burn record onto `device`
pub fn record_from_bytes<B: Backend, R: Record<B>>(bytes: &[u8], device: &B::Device) -> Result<R> {
    Recorder::<B>::load(&BytesRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| anyhow!("Failed to deserialize record: {:?}", e))
}

/// Serialize module weights
pub fn module_to_bytes<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<u8>> {
    record_to_bytes::<B, M::Record>(module.clone().into_record())
}

/// Load weights into `module`
pub fn module_from_bytes<B: Backend, M: Module<B>>(
    module: M,
    bytes: &[u8],
    device: &B::Device,
) -> Result<M> {
    let record = record_from_bytes::<B, M::Record>(bytes, device)?;
    Ok(module.load_record(record))
}
