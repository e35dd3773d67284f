pub mod checkpoint;
pub mod loss;
pub mod optim;
pub mod record;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Execution mode passed to every forward call.
///
/// `Eval` means no parameter updates follow and mode-sensitive layers
/// (dropout, batch statistics) should run in inference behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Network driven by the trainer.
///
/// Implementations wrap a concrete architecture. Weights are exchanged as an
/// opaque byte blob so checkpoints do not depend on the network type; see
/// [`record`] for helpers that do this for burn modules.
pub trait Model: Sized {
    /// Network input produced by pretreatment
    type Input;
    /// Raw network output consumed by posttreatment
    type Output;

    /// Run the network
    fn forward(&self, input: &Self::Input, mode: Mode) -> Result<Self::Output>;

    /// Serialize weights
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Replace weights with a blob produced by [`to_bytes`](Self::to_bytes)
    fn load_bytes(self, bytes: &[u8]) -> Result<Self>;
}
