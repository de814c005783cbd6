use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::media::{
    DeviceHandle, DeviceInfo, DeviceKind, LocalStream, LocalTrack, MediaConstraints, MediaDevices,
    TrackKind,
};
use crate::Error;

/// Opens the camera and, when asked for and present, the microphone.
///
/// Fails with [`Error::MediaUnavailable`] when there is no camera and with
/// [`Error::PermissionDenied`] when the OS refuses access. A host without a
/// microphone gets a video-only stream. Devices opened before a failure are
/// released again.
pub async fn acquire_local_media(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
) -> Result<LocalStream, Error> {
    let available = devices.enumerate().await?;
    let camera = pick(&available, DeviceKind::VideoInput, &constraints.facing_mode)
        .ok_or_else(|| Error::MediaUnavailable("no camera found".to_string()))?;

    let mut stream = LocalStream::new(uuid::Uuid::new_v4().to_string(), Vec::new());
    let handle = devices.open(camera).await?;
    let track = LocalTrack::new(TrackKind::Video, stream.id(), camera, handle);
    stream.tracks.push(Arc::new(track));

    let microphone = if constraints.audio {
        pick(&available, DeviceKind::AudioInput, "")
    } else {
        None
    };
    if constraints.audio && microphone.is_none() {
        warn!("no microphone found, sending video only");
    }
    if let Some(microphone) = microphone {
        let handle = devices.open(microphone).await?;
        let track = LocalTrack::new(TrackKind::Audio, stream.id(), microphone, handle);
        stream.tracks.push(Arc::new(track));
    }

    info!(
        "acquired local media {} ({} tracks, ideal {}x{})",
        stream.id(),
        stream.tracks().len(),
        constraints.ideal_width,
        constraints.ideal_height
    );
    Ok(stream)
}

/// First device of `kind`, preferring one whose label mentions `hint`.
fn pick<'a>(devices: &'a [DeviceInfo], kind: DeviceKind, hint: &str) -> Option<&'a DeviceInfo> {
    let mut candidates = devices.iter().filter(|d| d.kind == kind);
    if hint.is_empty() {
        return candidates.next();
    }
    let hint = hint.to_lowercase();
    devices
        .iter()
        .filter(|d| d.kind == kind)
        .find(|d| d.label.to_lowercase().contains(&hint))
        .or_else(|| candidates.next())
}

/// V4L2 cameras and ALSA capture devices found under `/dev`.
#[derive(Debug, Clone)]
pub struct SystemDevices {
    dev: PathBuf,
    sysfs: PathBuf,
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemDevices {
    pub fn new() -> Self {
        Self::with_roots("/dev", "/sys/class/video4linux")
    }

    pub fn with_roots(dev: impl Into<PathBuf>, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            dev: dev.into(),
            sysfs: sysfs.into(),
        }
    }

    fn scan(&self) -> io::Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.dev)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with("video") {
                let label = fs::read_to_string(self.sysfs.join(&name).join("name"))
                    .map(|label| label.trim().to_string())
                    .unwrap_or_else(|_| name.clone());
                devices.push(DeviceInfo {
                    id: self.dev.join(&name).to_string_lossy().into_owned(),
                    kind: DeviceKind::VideoInput,
                    label,
                });
            }
        }
        match fs::read_dir(self.dev.join("snd")) {
            Ok(entries) => {
                for entry in entries {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    if is_capture_pcm(&name) {
                        devices.push(DeviceInfo {
                            id: self.dev.join("snd").join(&name).to_string_lossy().into_owned(),
                            kind: DeviceKind::AudioInput,
                            label: name,
                        });
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}

/// `pcmC0D0c` is a capture device, `pcmC0D0p` a playback one.
fn is_capture_pcm(name: &str) -> bool {
    name.starts_with("pcmC") && name.ends_with('c') && name.contains('D')
}

fn open_device(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", path.display(), e))
            }
            _ => Error::MediaUnavailable(format!("{}: {}", path.display(), e)),
        })
}

struct OpenDevice {
    file: File,
    path: String,
}

impl DeviceHandle for OpenDevice {
    fn release(self: Box<Self>) {
        trace!("releasing {}", self.path);
        drop(self.file);
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, Error> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.scan())
            .await
            .map_err(|e| Error::MediaUnavailable(e.to_string()))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => Error::PermissionDenied(e.to_string()),
                _ => Error::MediaUnavailable(e.to_string()),
            })
    }

    async fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceHandle>, Error> {
        let path = device.id.clone();
        let file = tokio::task::spawn_blocking({
            let path = path.clone();
            move || open_device(Path::new(&path))
        })
        .await
        .map_err(|e| Error::MediaUnavailable(e.to_string()))??;
        debug!("opened {} ({})", device.label, path);
        Ok(Box::new(OpenDevice { file, path }))
    }
}
