//! Inbound media
//!
//! A viewer session exposes exactly one `MediaStream`: the remote tracks
//! that arrived on the current transport plus a broadcast channel carrying
//! their RTP packets to whoever renders them.

use super::transport::{InboundTrack, MediaKind};
use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

/// Capacity of the per-stream packet fan-out
pub const PACKET_CHANNEL_CAPACITY: usize = 512;

/// One RTP packet received on an inbound track
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub track_id: String,
    pub kind: MediaKind,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn from_rtp(track: &InboundTrack, packet: &Packet) -> Self {
        Self {
            track_id: track.id.clone(),
            kind: track.kind,
            payload_type: packet.header.payload_type,
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            marker: packet.header.marker,
            payload: packet.payload.clone(),
        }
    }
}

/// The inbound stream attached to the presentation layer
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<InboundTrack>,
    packets: broadcast::Sender<MediaPacket>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, packets: broadcast::Sender<MediaPacket>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
            packets,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[InboundTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&InboundTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Attach a track; a track already present by id is replaced and
    /// `false` is returned.
    pub(crate) fn attach(&mut self, track: InboundTrack) -> bool {
        if let Some(existing) = self.tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Receive RTP packets from every track of this stream
    pub fn subscribe(&self) -> broadcast::Receiver<MediaPacket> {
        self.packets.subscribe()
    }
}

/// Forward RTP from a remote track until the track ends
pub(crate) fn spawn_track_reader(
    track: Arc<TrackRemote>,
    info: InboundTrack,
    packets: broadcast::Sender<MediaPacket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut count: u64 = 0;
        loop {
            match track.read_rtp().await {
                Ok((packet, _)) => {
                    count += 1;
                    if count == 1 {
                        info!("First RTP packet on {} track {} ({})", info.kind.as_str(), info.id, info.codec);
                    }
                    // No subscribers is not an error; the packet is dropped.
                    let _ = packets.send(MediaPacket::from_rtp(&info, &packet));
                }
                Err(e) => {
                    debug!("Track {} reader stopped after {} packets: {}", info.id, count, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;

    fn video_track(id: &str) -> InboundTrack {
        InboundTrack {
            id: id.to_string(),
            stream_id: "stream".to_string(),
            kind: MediaKind::Video,
            ssrc: 0x1234_5678,
            codec: "video/VP8".to_string(),
        }
    }

    #[test]
    fn media_packet_copies_rtp_header() {
        let packet = Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: 96,
                sequence_number: 1,
                timestamp: 3000,
                ssrc: 0x1234_5678,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x00, 0x01, 0x02]),
        };

        let media = MediaPacket::from_rtp(&video_track("v0"), &packet);
        assert_eq!(media.track_id, "v0");
        assert_eq!(media.kind, MediaKind::Video);
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.sequence_number, 1);
        assert_eq!(media.timestamp, 3000);
        assert!(media.marker);
        assert_eq!(&media.payload[..], &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn attach_replaces_duplicate_track_ids() {
        let (tx, _rx) = broadcast::channel(4);
        let mut stream = MediaStream::new("stream", tx);

        assert!(stream.attach(video_track("v0")));
        let mut renegotiated = video_track("v0");
        renegotiated.codec = "video/H264".to_string();
        assert!(!stream.attach(renegotiated));

        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.track(MediaKind::Video).map(|t| t.codec.as_str()), Some("video/H264"));
        assert!(stream.track(MediaKind::Audio).is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_forwarded_packets() {
        let (tx, _rx) = broadcast::channel(4);
        let stream = MediaStream::new("stream", tx.clone());
        let mut rx = stream.subscribe();

        let packet = MediaPacket {
            track_id: "v0".to_string(),
            kind: MediaKind::Video,
            payload_type: 96,
            sequence_number: 9,
            timestamp: 0,
            marker: false,
            payload: Bytes::new(),
        };
        tx.send(packet).unwrap();
        assert_eq!(rx.recv().await.unwrap().sequence_number, 9);
    }
}
