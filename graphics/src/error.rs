//! Graphics error types.

use std::fmt;

use ash::vk;

/// Errors that can occur in the command submission core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Failed to initialize the command processor.
    InitializationFailed(String),
    /// Failed to create a resource.
    ResourceCreationFailed(String),
    /// Out of GPU or host memory.
    OutOfMemory,
    /// The GPU device was lost. Sticky until the owner resets the processor.
    DeviceLost,
    /// A queue operation was rejected; the submission stays open for a retry.
    SubmissionFailed(String),
    /// A transient allocator hit its page limit.
    PoolExhausted,
    /// A cache clear was attempted while GPU work was still in flight.
    CacheClearWhileBusy,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// An internal error occurred.
    Internal(String),
}

impl GraphicsError {
    /// Map a failed Vulkan call to an error, keeping device loss and
    /// memory exhaustion distinguishable.
    pub fn from_vk(context: &str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            other => Self::Internal(format!("{context}: {other:?}")),
        }
    }

    /// Whether this error puts the processor into the lost-device state.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::SubmissionFailed(msg) => write!(f, "submission failed: {msg}"),
            Self::PoolExhausted => write!(f, "transient pool exhausted"),
            Self::CacheClearWhileBusy => write!(f, "cache clear requested with work in flight"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GraphicsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::SubmissionFailed("queue rejected batch".to_string());
        assert_eq!(err.to_string(), "submission failed: queue rejected batch");
    }

    #[test]
    fn test_from_vk_maps_device_loss() {
        assert_eq!(
            GraphicsError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST),
            GraphicsError::DeviceLost
        );
        assert_eq!(
            GraphicsError::from_vk("vkCreateFence", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GraphicsError::OutOfMemory
        );
        assert!(matches!(
            GraphicsError::from_vk("vkQueueSubmit", vk::Result::ERROR_UNKNOWN),
            GraphicsError::Internal(msg) if msg.starts_with("vkQueueSubmit")
        ));
    }
}
