use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the device layer and the benchmark driver can report.
///
/// None of these are recovered from locally: a failing call aborts the
/// benchmark case that issued it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation failed: {0}")]
    AllocationError(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid shader binary: {0}")]
    InvalidShaderBinary(String),

    #[error("entry point `{0}` not found in shader module")]
    EntryPointNotFound(String),

    #[error("specialization constant {id} required by the shader module was not supplied")]
    MissingSpecializationConstant { id: u32 },

    #[error("specialization constant {id} is declared as {declared} but {supplied} was supplied")]
    SpecConstantTypeMismatch {
        id: u32,
        declared: &'static str,
        supplied: &'static str,
    },

    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("binding mismatch: {0}")]
    BindingMismatch(String),

    #[error("descriptor pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("invalid command buffer state: {0}")]
    InvalidState(String),

    #[error("queue submission failed: {0}")]
    SubmissionError(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("destination buffer element #{index} has incorrect value: expected to be {expected} but found {actual}")]
    VerificationFailure { index: usize, expected: f32, actual: f32 },

    #[error("invalid benchmark case: {0}")]
    InvalidCase(String),

    #[error("no suitable GPU adapter found")]
    AdapterNotFound,

    #[error("failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the device that produced this error can still be used.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, Error::DeviceLost(_))
    }
}
