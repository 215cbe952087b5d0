// Persistent pipeline-cache blob
//
// The driver's pipeline cache is serialised at shutdown and fed back as initial
// data on the next run. Blobs are keyed by vendor/device/driver/UUID in the file
// name, and the header is checked again on load, so a blob from another GPU or
// driver is never handed to the driver.

use anyhow::{Context, Result};
use ash::vk;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Header length for VK_PIPELINE_CACHE_HEADER_VERSION_ONE
const HEADER_SIZE: usize = 16 + vk::UUID_SIZE;

/// Identity of the physical device + driver a blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    pub cache_uuid: [u8; vk::UUID_SIZE],
}

impl DeviceIdentity {
    pub fn from_properties(props: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            driver_version: props.driver_version,
            cache_uuid: props.pipeline_cache_uuid,
        }
    }

    pub fn file_name(&self) -> String {
        let uuid: String = self.cache_uuid.iter().map(|b| format!("{:02x}", b)).collect();
        format!(
            "vk_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
            self.vendor_id, self.device_id, self.driver_version, uuid
        )
    }

    /// Does `data` start with a version-one header written for this device?
    pub fn matches_header(&self, data: &[u8]) -> bool {
        if data.len() < HEADER_SIZE {
            return false;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        word(0) as usize >= HEADER_SIZE
            && word(4) == vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32
            && word(8) == self.vendor_id
            && word(12) == self.device_id
            && data[16..HEADER_SIZE] == self.cache_uuid
    }
}

/// Location and initial contents of one device's pipeline-cache blob
pub struct PipelineCacheBlob {
    path: PathBuf,
    identity: DeviceIdentity,
    initial_data: Vec<u8>,
}

impl PipelineCacheBlob {
    /// Read the blob saved for `identity`, if any
    pub fn load(dir: &Path, identity: DeviceIdentity) -> Self {
        let path = dir.join(identity.file_name());

        let initial_data = match fs::read(&path) {
            Ok(data) if identity.matches_header(&data) => {
                log::info!("Loaded pipeline cache ({} bytes) from {:?}", data.len(), path);
                data
            }
            Ok(_) => {
                log::warn!("Ignoring pipeline cache {:?}: header does not match this device", path);
                Vec::new()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No pipeline cache at {:?}, starting empty", path);
                Vec::new()
            }
            Err(e) => {
                log::warn!("Failed to read pipeline cache {:?}: {}", path, e);
                Vec::new()
            }
        };

        Self {
            path,
            identity,
            initial_data,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn initial_data(&self) -> &[u8] {
        &self.initial_data
    }

    pub fn is_seeded(&self) -> bool {
        !self.initial_data.is_empty()
    }

    /// Create the live driver cache, seeded with the loaded blob
    pub fn create_cache(&self, device: &ash::Device) -> Result<vk::PipelineCache> {
        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(&self.initial_data);
        match unsafe { device.create_pipeline_cache(&create_info, None) } {
            Ok(cache) => Ok(cache),
            Err(e) if self.is_seeded() => {
                log::warn!("Driver rejected pipeline cache blob ({}), starting empty", e);
                let empty = vk::PipelineCacheCreateInfo::builder();
                unsafe { device.create_pipeline_cache(&empty, None) }
                    .context("Failed to create pipeline cache")
            }
            Err(e) => Err(e).context("Failed to create pipeline cache"),
        }
    }

    /// Serialise the live cache to disk
    pub fn save(&self, device: &ash::Device, cache: vk::PipelineCache) -> Result<()> {
        let data = unsafe { device.get_pipeline_cache_data(cache) }
            .context("Failed to read pipeline cache data")?;
        self.store(&data)
    }

    pub fn store(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            log::debug!("Pipeline cache is empty, not writing {:?}", self.path);
            return Ok(());
        }
        write_atomic(&self.path, data)?;
        log::info!("Saved pipeline cache ({} bytes) to {:?}", data.len(), self.path);
        Ok(())
    }
}

/// Write to a sibling temp file, then rename over `path`
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{:?} has no parent directory", path))?;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("{:?} has no file name", path))?
        .to_string_lossy();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let written = fs::File::create(&tmp)
        .with_context(|| format!("Failed to create {:?}", tmp))
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })
        .and_then(|_| fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", path)));

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uuid_byte: u8) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 0x2_1a4_000,
            cache_uuid: [uuid_byte; vk::UUID_SIZE],
        }
    }

    fn blob_for(identity: &DeviceIdentity, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&identity.vendor_id.to_le_bytes());
        data.extend_from_slice(&identity.device_id.to_le_bytes());
        data.extend_from_slice(&identity.cache_uuid);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn saved_blob_seeds_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(7);

        let first = PipelineCacheBlob::load(dir.path(), id);
        assert!(!first.is_seeded());
        let data = blob_for(&id, b"pipelines");
        first.store(&data).unwrap();

        let second = PipelineCacheBlob::load(dir.path(), id);
        assert!(second.is_seeded());
        assert_eq!(second.initial_data(), data.as_slice());
        assert_eq!(second.path(), first.path());
    }

    #[test]
    fn different_uuids_use_different_files() {
        assert_ne!(identity(1).file_name(), identity(2).file_name());

        let mut other_driver = identity(1);
        other_driver.driver_version += 1;
        assert_ne!(identity(1).file_name(), other_driver.file_name());
    }

    #[test]
    fn mismatched_header_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(3);
        let foreign = blob_for(&identity(4), b"other gpu");
        fs::write(dir.path().join(id.file_name()), foreign).unwrap();

        assert!(!PipelineCacheBlob::load(dir.path(), id).is_seeded());
    }

    #[test]
    fn truncated_blob_is_ignored() {
        let id = identity(5);
        assert!(!id.matches_header(&blob_for(&id, b"")[..HEADER_SIZE - 1]));
        assert!(id.matches_header(&blob_for(&id, b"")));
    }

    #[test]
    fn empty_cache_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let blob = PipelineCacheBlob::load(dir.path(), identity(9));
        blob.store(&[]).unwrap();
        assert!(!blob.path().exists());
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("blob.bin");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn failed_rename_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), b"x").unwrap();

        assert!(write_atomic(&path, b"data").is_err());

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("blob.bin")]);
    }
}
