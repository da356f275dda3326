use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Локальный трек. Захват пишет сэмплы в `track`, соединение их отправляет.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, id: &str, stream_id: &str) -> Self {
        let capability = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        };
        Self {
            id: id.to_owned(),
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_owned(),
                stream_id.to_owned(),
            )),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Трек, пришедший от удалённой стороны
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub remote: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Источник локального медиа (камера/микрофон)
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, video: bool, audio: bool) -> Result<MediaStream, MediaError>;
}

/// Поверхности отрисовки: локальное превью и удалённый поток
pub trait RenderSurface: Send + Sync {
    fn attach_local(&self, stream: &MediaStream);
    fn attach_remote(&self, track: RemoteTrack);
}

/// VP8 + Opus треки без реального устройства захвата
#[derive(Debug, Default, Clone)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self, video: bool, audio: bool) -> Result<MediaStream, MediaError> {
        if !video && !audio {
            return Err(MediaError::NothingRequested);
        }
        let stream_id = format!("ssc-{}", random_id());
        let mut tracks = Vec::new();
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video, "video", &stream_id));
        }
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "audio", &stream_id));
        }
        Ok(MediaStream {
            id: stream_id,
            tracks,
        })
    }
}

/// Поверхность, которая только пишет в лог
#[derive(Debug, Default, Clone)]
pub struct LogSurface;

impl RenderSurface for LogSurface {
    fn attach_local(&self, stream: &MediaStream) {
        info!(stream_id = %stream.id, tracks = stream.tracks.len(), "local preview attached");
    }

    fn attach_remote(&self, track: RemoteTrack) {
        info!(track_id = %track.id, stream_id = %track.stream_id, kind = ?track.kind, "remote track attached");
    }
}
