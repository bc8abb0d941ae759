//! HLS sources.
//!
//! The playlist is polled and every new media segment is fetched in order and
//! handed out chunk by chunk, so the session sees one continuous byte stream.
//! Segments are passed through untouched.

use crate::connector::{ChunkSource, ConnectError, ReadError, open};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Segments taken from the end of the first playlist, the live edge.
const LIVE_EDGE_SEGMENTS: usize = 3;
const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(10);
/// Longest target duration a live playlist may announce.
const MAX_TARGET_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq)]
pub(crate) enum Playlist {
    Master { variants: Vec<String> },
    Media(MediaPlaylist),
}

#[derive(Debug, PartialEq)]
pub(crate) struct MediaPlaylist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    pub segments: Vec<String>,
    pub ended: bool,
}

pub(crate) fn parse_playlist(text: &str) -> Result<Playlist, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err("missing #EXTM3U header".into());
    }

    let mut target_duration = DEFAULT_TARGET_DURATION;
    let mut media_sequence = 0;
    let mut ended = false;
    let mut segments = Vec::new();
    let mut variants = Vec::new();
    let mut expect_variant = false;

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = parse_target_duration(value)?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value
                .parse()
                .map_err(|_| format!("invalid media sequence: {value}"))?;
        } else if line.starts_with("#EXT-X-ENDLIST") {
            ended = true;
        } else if line.starts_with("#EXT-X-STREAM-INF") {
            expect_variant = true;
        } else if line.starts_with('#') {
            continue;
        } else if expect_variant {
            variants.push(line.to_string());
            expect_variant = false;
        } else {
            segments.push(line.to_string());
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master { variants });
    }

    Ok(Playlist::Media(MediaPlaylist {
        target_duration,
        media_sequence,
        segments,
        ended,
    }))
}

fn parse_target_duration(value: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid target duration: {value}");
    let secs: f64 = value.parse().map_err(|_| invalid())?;
    if !secs.is_finite() {
        return Err(invalid());
    }
    let duration = Duration::try_from_secs_f64(secs.max(1.0)).map_err(|_| invalid())?;
    if duration > MAX_TARGET_DURATION {
        return Err(invalid());
    }
    Ok(duration)
}

pub(crate) struct HlsSource {
    client: reqwest::Client,
    playlist_url: Url,
    headers: HeaderMap,
    target_duration: Duration,
    next_sequence: u64,
    queue: VecDeque<Url>,
    current: Option<reqwest::Response>,
    ended: bool,
    next_poll: Instant,
}

impl HlsSource {
    pub(crate) async fn open(
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
    ) -> Result<Self, ConnectError> {
        let (playlist_url, playlist) = match fetch_playlist(&client, &url, &headers).await? {
            Playlist::Media(media) => (url, media),
            Playlist::Master { variants } => {
                let variant = resolve(&url, &variants[0]).map_err(ConnectError::Protocol)?;
                tracing::debug!(master = %url, variant = %variant, "following first variant");
                match fetch_playlist(&client, &variant, &headers).await? {
                    Playlist::Media(media) => (variant, media),
                    Playlist::Master { .. } => {
                        return Err(ConnectError::Protocol("nested master playlist".into()));
                    }
                }
            }
        };

        let mut source = HlsSource {
            client,
            playlist_url,
            headers,
            target_duration: playlist.target_duration,
            next_sequence: 0,
            queue: VecDeque::new(),
            current: None,
            ended: false,
            next_poll: Instant::now(),
        };

        // Start at the live edge rather than the oldest segment still listed.
        let skip = playlist.segments.len().saturating_sub(LIVE_EDGE_SEGMENTS);
        source.next_sequence = playlist.media_sequence + skip as u64;
        source.enqueue(playlist).map_err(ConnectError::Protocol)?;

        Ok(source)
    }

    /// Queues the segments not seen yet and schedules the next poll.
    fn enqueue(&mut self, playlist: MediaPlaylist) -> Result<usize, String> {
        let mut added = 0;
        for (i, uri) in playlist.segments.iter().enumerate() {
            let sequence = playlist.media_sequence + i as u64;
            if sequence < self.next_sequence {
                continue;
            }
            self.queue.push_back(resolve(&self.playlist_url, uri)?);
            self.next_sequence = sequence + 1;
            added += 1;
        }

        self.target_duration = playlist.target_duration;
        self.ended = playlist.ended;
        // Poll sooner when the playlist did not move, as players do.
        let delay = if added == 0 {
            self.target_duration / 2
        } else {
            self.target_duration
        };
        self.next_poll = Instant::now() + delay;

        Ok(added)
    }

    async fn refresh(&mut self) -> Result<(), ReadError> {
        tokio::time::sleep_until(self.next_poll).await;

        let playlist = fetch_playlist(&self.client, &self.playlist_url, &self.headers)
            .await
            .map_err(|e| match e {
                ConnectError::ConnectTimeout => ReadError::Timeout,
                ConnectError::Protocol(msg) => ReadError::Protocol(msg),
                _ => ReadError::Disconnected,
            })?;

        match playlist {
            Playlist::Media(media) => {
                let added = self.enqueue(media).map_err(ReadError::Protocol)?;
                tracing::trace!(playlist = %self.playlist_url, added, "playlist refreshed");
                Ok(())
            }
            Playlist::Master { .. } => Err(ReadError::Protocol(
                "media playlist turned into a master playlist".into(),
            )),
        }
    }
}

#[async_trait]
impl ChunkSource for HlsSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ReadError> {
        loop {
            if let Some(response) = self.current.as_mut() {
                match response.chunk().await? {
                    Some(bytes) => return Ok(Some(bytes)),
                    None => self.current = None,
                }
                continue;
            }

            if let Some(segment) = self.queue.pop_front() {
                let response = open(&self.client, &segment, &self.headers)
                    .await
                    .map_err(|e| ReadError::Protocol(format!("segment {segment}: {e}")))?;
                self.current = Some(response);
                continue;
            }

            if self.ended {
                return Ok(None);
            }

            self.refresh().await?;
        }
    }

    fn content_type(&self) -> Option<&str> {
        Some("video/mp2t")
    }

    fn read_allowance(&self) -> Duration {
        self.target_duration.saturating_mul(2)
    }
}

async fn fetch_playlist(
    client: &reqwest::Client,
    url: &Url,
    headers: &HeaderMap,
) -> Result<Playlist, ConnectError> {
    let text = open(client, url, headers).await?.text().await?;
    parse_playlist(&text).map_err(ConnectError::Protocol)
}

fn resolve(base: &Url, uri: &str) -> Result<Url, String> {
    base.join(uri)
        .map_err(|e| format!("invalid playlist entry {uri}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{HttpConnector, SourceConnector, UpstreamHandle};
    use crate::failover::FailoverPolicy;
    use crate::testutils::{TestRoute, TestUpstreamServer, test_failover_settings, wait_until};
    use crate::types::{Protocol, SourceCandidate, SourceSpec};
    use std::sync::Arc;

    #[test]
    fn test_parse_media_playlist() {
        let text = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXT-X-MEDIA-SEQUENCE:41\n\
            #EXTINF:6.0,\n\
            seg41.ts\n\
            #EXTINF:6.0,\n\
            seg42.ts\n";

        let Playlist::Media(media) = parse_playlist(text).unwrap() else {
            panic!("expected media playlist");
        };
        assert_eq!(media.target_duration, Duration::from_secs(6));
        assert_eq!(media.media_sequence, 41);
        assert_eq!(media.segments, vec!["seg41.ts", "seg42.ts"]);
        assert!(!media.ended);
    }

    #[test]
    fn test_parse_master_playlist() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1280000\n\
            low/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2560000\n\
            high/index.m3u8\n";

        assert_eq!(
            parse_playlist(text).unwrap(),
            Playlist::Master {
                variants: vec!["low/index.m3u8".into(), "high/index.m3u8".into()]
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_playlist("<html></html>").is_err());
        assert!(parse_playlist("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc\n").is_err());
    }

    #[test]
    fn test_parse_target_duration_bounds() {
        for value in ["1e30", "inf", "NaN", "61", "abc"] {
            let text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:{value}\nseg1.ts\n");
            assert!(parse_playlist(&text).is_err(), "accepted {value}");
        }

        let Playlist::Media(media) =
            parse_playlist("#EXTM3U\n#EXT-X-TARGETDURATION:0.2\nseg1.ts\n").unwrap()
        else {
            panic!("expected media playlist");
        };
        assert_eq!(media.target_duration, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bad_playlist_fails_over_to_next_source() {
        let server = TestUpstreamServer::spawn(vec![
            (
                "/bad.m3u8",
                TestRoute::Text("#EXTM3U\n#EXT-X-TARGETDURATION:1e30\nseg1.ts\n".into()),
            ),
            ("/live.ts", TestRoute::Chunks(vec![b"ok".to_vec()])),
        ])
        .await;

        let connector = Arc::new(HttpConnector::new(Duration::from_secs(2), "test").unwrap());
        let policy = FailoverPolicy::new(connector, test_failover_settings());
        let spec = SourceSpec::new(vec![
            SourceCandidate::new(server.url("/bad.m3u8")).with_protocol(Protocol::Hls),
            SourceCandidate::new(server.url("/live.ts")),
        ]);

        let mut acquired = policy.acquire("news", &spec, 0).await.unwrap();
        assert_eq!(acquired.index, 1);
        assert_eq!(acquired.handle.read_chunk().await.unwrap(), &b"ok"[..]);
    }

    fn live_playlist(segments: &[u32], ended: bool) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{}\n",
            segments[0]
        );
        for n in segments {
            text.push_str(&format!("#EXTINF:1.0,\nseg{n}.ts\n"));
        }
        if ended {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    #[tokio::test]
    async fn test_hls_refresh_picks_up_new_segments() {
        let server = TestUpstreamServer::spawn(vec![
            ("/live.m3u8", TestRoute::Text(live_playlist(&[1, 2], false))),
            ("/seg1.ts", TestRoute::Chunks(vec![b"1".to_vec()])),
            ("/seg2.ts", TestRoute::Chunks(vec![b"2".to_vec()])),
            ("/seg3.ts", TestRoute::Chunks(vec![b"3".to_vec()])),
        ])
        .await;

        let connector = HttpConnector::new(Duration::from_secs(2), "test").unwrap();
        let candidate =
            SourceCandidate::new(server.url("/live.m3u8")).with_protocol(Protocol::Hls);
        let source = connector.connect(&candidate).await.unwrap();
        let mut handle = UpstreamHandle::new(source, Duration::from_secs(2));

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Ok(bytes) = handle.read_chunk().await {
                received.extend_from_slice(&bytes);
            }
            received
        });

        // The first refresh finds nothing new; the segment shows up before
        // the next one.
        wait_until(|| server.request_count("/live.m3u8") >= 2).await;
        server.set_route("/live.m3u8", TestRoute::Text(live_playlist(&[2, 3], true)));

        assert_eq!(reader.await.unwrap(), b"123");
        assert!(server.request_count("/live.m3u8") >= 3);
        for segment in ["/seg1.ts", "/seg2.ts", "/seg3.ts"] {
            assert_eq!(server.request_count(segment), 1, "{segment}");
        }
    }

    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nhls/index.m3u8\n";

    #[tokio::test]
    async fn test_hls_stream_starts_at_live_edge() {
        let playlist = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:1\n\
            #EXT-X-MEDIA-SEQUENCE:7\n\
            #EXTINF:1.0,\nseg7.ts\n\
            #EXTINF:1.0,\nseg8.ts\n\
            #EXTINF:1.0,\nseg9.ts\n\
            #EXTINF:1.0,\nseg10.ts\n\
            #EXT-X-ENDLIST\n";
        let server = TestUpstreamServer::spawn(vec![
            ("/master.m3u8", TestRoute::Text(MASTER.into())),
            ("/hls/index.m3u8", TestRoute::Text(playlist.into())),
            ("/hls/seg7.ts", TestRoute::Chunks(vec![b"7".to_vec()])),
            ("/hls/seg8.ts", TestRoute::Chunks(vec![b"8".to_vec()])),
            ("/hls/seg9.ts", TestRoute::Chunks(vec![b"9".to_vec()])),
            ("/hls/seg10.ts", TestRoute::Chunks(vec![b"10".to_vec()])),
        ])
        .await;

        let connector = HttpConnector::new(Duration::from_secs(2), "test").unwrap();
        let candidate =
            SourceCandidate::new(server.url("/master.m3u8")).with_protocol(Protocol::Hls);
        let source = connector.connect(&candidate).await.unwrap();
        let mut handle = UpstreamHandle::new(source, Duration::from_secs(2));

        let mut received = Vec::new();
        while let Ok(bytes) = handle.read_chunk().await {
            received.extend_from_slice(&bytes);
        }

        assert_eq!(received, b"8910");
        assert!(!server.was_requested("/hls/seg7.ts"));
    }
}
