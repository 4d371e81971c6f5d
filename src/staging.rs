//! Host <-> device transfers through temporary host-visible buffers.

use crate::error::Result;
use crate::gpu::{Buffer, BufferUsage, Device, MemoryClass};

/// Fills the first `size` bytes of device buffer `dst`.
///
/// `fill` writes into a mapped staging buffer which is then copied to `dst`;
/// the call returns once the copy has completed on the device.
pub fn set_device_buffer_via_staging(
    device: &Device,
    dst: &Buffer,
    size: u64,
    fill: impl FnOnce(&mut [u8]),
) -> Result<()> {
    let mut staging = device.create_labeled_buffer(
        "upload staging",
        BufferUsage::COPY_SRC,
        MemoryClass::HostVisibleCoherent,
        size,
    )?;
    let mut mapping = staging.map(0, size)?;
    fill(mapping.bytes_mut());
    mapping.unmap()?;

    copy_buffer_and_wait(device, &staging, dst, size)
}

/// Copies the first `size` bytes of device buffer `src` to the host and hands
/// them to `inspect`.
pub fn get_device_buffer_via_staging(
    device: &Device,
    src: &Buffer,
    size: u64,
    inspect: impl FnOnce(&[u8]) -> Result<()>,
) -> Result<()> {
    let mut staging = device.create_labeled_buffer(
        "readback staging",
        BufferUsage::COPY_DST,
        MemoryClass::HostVisibleCoherent,
        size,
    )?;
    copy_buffer_and_wait(device, src, &staging, size)?;

    let mapping = staging.map(0, size)?;
    let result = inspect(mapping.bytes());
    mapping.unmap()?;
    result
}

/// Records a single whole-range copy and waits for it to finish.
pub fn copy_buffer_and_wait(device: &Device, src: &Buffer, dst: &Buffer, size: u64) -> Result<()> {
    let mut cmd = device.allocate_command_buffer()?;
    cmd.begin()?;
    cmd.copy_buffer(src, 0, dst, 0, size)?;
    cmd.end()?;
    device.queue_submit_and_wait(&mut cmd)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::gpu::SoftBackend;

    #[test]
    fn round_trip_through_device_local_buffer() {
        let backend = Arc::new(SoftBackend::new());
        let device = Device::new(backend.clone());
        let buffer = device
            .create_buffer(
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST | BufferUsage::STORAGE,
                MemoryClass::DeviceLocal,
                64,
            )
            .unwrap();

        set_device_buffer_via_staging(&device, &buffer, 64, |bytes| {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = i as u8;
            }
        })
        .unwrap();

        let mut seen = Vec::new();
        get_device_buffer_via_staging(&device, &buffer, 64, |bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (0..64).collect::<Vec<u8>>());

        // Only the device buffer itself is left.
        assert_eq!(backend.live_objects(), 1);
    }

    #[test]
    fn inspect_error_is_returned() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let buffer = device
            .create_buffer(BufferUsage::COPY_SRC, MemoryClass::DeviceLocal, 16)
            .unwrap();
        let err = get_device_buffer_via_staging(&device, &buffer, 16, |_| {
            Err(Error::InvalidCase("rejected".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidCase(_)));
    }

    #[test]
    fn transfer_larger_than_destination_fails() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let buffer = device
            .create_buffer(BufferUsage::COPY_DST, MemoryClass::DeviceLocal, 16)
            .unwrap();
        assert!(matches!(
            set_device_buffer_via_staging(&device, &buffer, 32, |_| {}),
            Err(Error::InvalidOperation(_))
        ));
    }
}
