//! Theme-song index adapter for the AnimeThemes API.

use std::time::Duration;

use log::debug;
use serde_json::Value;
use url::Url;

use crate::backends::http::{build_agent, get_json_once, request_url};
use crate::backends::{with_rate_limit_retry, MediaIndex, RetryPolicy};
use crate::config::{EndpointsConfig, HttpConfig, ResolverConfig};
use crate::error::UpstreamError;
use crate::protocol::MediaLink;

const EXTERNAL_SITE_TAG: &str = "MyAnimeList";
const THEME_INCLUDES: &str =
    "animethemes,animethemes.song,animethemes.animethemeentries.videos.audio";
const VIDEO_HOST: &str = "v.animethemes.moe";
const AUDIO_HOST: &str = "a.animethemes.moe";
const AUDIO_EXTENSION: &str = "ogg";

/// Derives the audio-only link for a theme video link.
///
/// Video and audio files share a basename; only the host and extension differ.
/// Returns `None` for links that are not on the video host.
pub fn audio_link_from_video(video_link: &str) -> Option<String> {
    let mut url = Url::parse(video_link.trim()).ok()?;
    if url.host_str()? != VIDEO_HOST {
        return None;
    }
    let path = url.path().to_string();
    let (stem, _extension) = path.rsplit_once('.')?;
    if stem.is_empty() || stem.ends_with('/') {
        return None;
    }
    url.set_host(Some(AUDIO_HOST)).ok()?;
    url.set_path(&format!("{stem}.{AUDIO_EXTENSION}"));
    Some(url.to_string())
}

/// Media index adapter backed by `ureq`.
pub struct AnimeThemesIndex {
    http_client: ureq::Agent,
    media_index_url: String,
    user_agent: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl AnimeThemesIndex {
    pub fn new(endpoints: &EndpointsConfig, http: &HttpConfig, resolver: &ResolverConfig) -> Self {
        Self {
            http_client: build_agent(http.connect_timeout(), http.media_index_timeout()),
            media_index_url: endpoints.media_index_url.clone(),
            user_agent: endpoints.user_agent.clone(),
            timeout: http.media_index_timeout(),
            retry: RetryPolicy::from_config(resolver),
        }
    }

    fn text_or_unknown(value: Option<&Value>) -> String {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or("Unknown")
            .to_string()
    }

    fn theme_link(theme: &Value) -> Option<String> {
        let video = theme
            .get("animethemeentries")?
            .as_array()?
            .first()?
            .get("videos")?
            .as_array()?
            .first()?;
        let direct = video
            .get("audio")
            .and_then(|audio| audio.get("link"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|link| !link.is_empty())
            .map(ToOwned::to_owned);
        direct.or_else(|| {
            video
                .get("link")
                .and_then(Value::as_str)
                .and_then(audio_link_from_video)
        })
    }

    pub(crate) fn parse_themes(payload: &Value) -> Vec<MediaLink> {
        let Some(anime) = payload
            .get("anime")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
        else {
            return Vec::new();
        };

        anime
            .get("animethemes")
            .and_then(Value::as_array)
            .map(|themes| {
                themes
                    .iter()
                    .filter_map(|theme| {
                        let source_url = Self::theme_link(theme)?;
                        Some(MediaLink {
                            theme_type: Self::text_or_unknown(theme.get("slug")),
                            song_title: Self::text_or_unknown(
                                theme.get("song").and_then(|song| song.get("title")),
                            ),
                            source_url,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MediaIndex for AnimeThemesIndex {
    fn fetch_themes(&self, canonical_id: u64) -> Result<Vec<MediaLink>, UpstreamError> {
        let id_text = canonical_id.to_string();
        let url = request_url(
            &self.media_index_url,
            &[
                ("filter[has]", "resources"),
                ("filter[site]", EXTERNAL_SITE_TAG),
                ("filter[external_id]", &id_text),
                ("include", THEME_INCLUDES),
            ],
        );
        let payload = with_rate_limit_retry(&self.retry, "Themes[index]", || {
            get_json_once(&self.http_client, &url, &self.user_agent, self.timeout)
        })?;
        let themes = Self::parse_themes(&payload);
        debug!("Themes[{}]: index returned {} theme(s)", canonical_id, themes.len());
        Ok(themes)
    }
}
