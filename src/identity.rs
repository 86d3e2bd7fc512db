//! Game and organizer normalization
//!
//! Platforms report the same game or organizer under different labels. The
//! `IdentityMap` turns platform-specific labels into canonical names:
//! - category names through game aliases (exact, case-insensitive)
//! - channel ids / logins / display names through organizer aliases
//! - titles and tags through keyword lists, for platforms without a
//!   category field
//!
//! Labels that match nothing are kept as `unmapped:<raw>`, never dropped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const UNKNOWN: &str = "unknown";
pub const UNMAPPED_PREFIX: &str = "unmapped:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NormalizedName {
    Canonical(String),
    Unmapped(String),
    Unknown,
}

impl NormalizedName {
    pub fn to_stored(&self) -> String {
        match self {
            NormalizedName::Canonical(name) => name.clone(),
            NormalizedName::Unmapped(raw) => format!("{}{}", UNMAPPED_PREFIX, raw),
            NormalizedName::Unknown => UNKNOWN.to_string(),
        }
    }

    pub fn from_stored(stored: &str) -> Self {
        if stored == UNKNOWN || stored.is_empty() {
            NormalizedName::Unknown
        } else if let Some(raw) = stored.strip_prefix(UNMAPPED_PREFIX) {
            NormalizedName::Unmapped(raw.to_string())
        } else {
            NormalizedName::Canonical(stored.to_string())
        }
    }

    fn unmapped_or_unknown(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            NormalizedName::Unknown
        } else {
            NormalizedName::Unmapped(raw.to_string())
        }
    }
}

impl fmt::Display for NormalizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_stored())
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse identity file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk form of the identity map. Every section maps a canonical name to
/// the labels that should resolve to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFile {
    #[serde(default)]
    pub games: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub organizers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub title_keywords: BTreeMap<String, Vec<String>>,
    /// Channels that only ever broadcast one game
    #[serde(default)]
    pub channel_games: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct IdentityMap {
    game_aliases: HashMap<String, String>,
    organizer_aliases: HashMap<String, String>,
    channel_games: HashMap<String, String>,
    /// Sorted by canonical game name; the first match wins
    title_keywords: Vec<(String, Vec<String>)>,
}

impl IdentityMap {
    pub fn from_file_contents(file: IdentityFile) -> Self {
        let mut game_aliases = HashMap::new();
        for (canonical, aliases) in &file.games {
            game_aliases.insert(canonical.to_lowercase(), canonical.clone());
            for alias in aliases {
                game_aliases.insert(alias.trim().to_lowercase(), canonical.clone());
            }
        }

        let mut organizer_aliases = HashMap::new();
        for (canonical, aliases) in &file.organizers {
            organizer_aliases.insert(canonical.to_lowercase(), canonical.clone());
            for alias in aliases {
                organizer_aliases.insert(alias.trim().to_lowercase(), canonical.clone());
            }
        }

        let mut channel_games = HashMap::new();
        for (game, channels) in &file.channel_games {
            for channel in channels {
                channel_games.insert(channel.trim().to_lowercase(), game.clone());
            }
        }

        let title_keywords = file
            .title_keywords
            .iter()
            .map(|(game, keywords)| {
                let keywords = keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (game.clone(), keywords)
            })
            .collect();

        Self {
            game_aliases,
            organizer_aliases,
            channel_games,
            title_keywords,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: display.clone(),
            source,
        })?;
        let file: IdentityFile =
            serde_json::from_str(&contents).map_err(|source| IdentityError::Parse {
                path: display,
                source,
            })?;
        Ok(Self::from_file_contents(file))
    }

    /// The file at `path` replaces the built-in map when given
    pub fn load(path: Option<&str>) -> Result<Self, IdentityError> {
        match path {
            Some(path) => {
                let map = Self::from_path(path)?;
                log::info!(
                    "🗺️  Loaded identity map from {} ({} game aliases, {} organizer aliases)",
                    path,
                    map.game_aliases.len(),
                    map.organizer_aliases.len()
                );
                Ok(map)
            }
            None => Ok(Self::defaults()),
        }
    }

    /// Game for a platform-reported category (Twitch `game_name`)
    pub fn game_from_category(&self, category: &str) -> NormalizedName {
        let category = category.trim();
        if category.is_empty() {
            return NormalizedName::Unknown;
        }
        if let Some(canonical) = self.game_aliases.get(&category.to_lowercase()) {
            return NormalizedName::Canonical(canonical.clone());
        }
        if let Some(canonical) = self.classify_text(&[category]) {
            return NormalizedName::Canonical(canonical);
        }
        NormalizedName::Unmapped(category.to_string())
    }

    /// Game for a broadcast without a category (YouTube).
    ///
    /// Channel mapping wins over title and tag keywords.
    pub fn game_from_broadcast(&self, channel_id: &str, title: &str, tags: &[String]) -> NormalizedName {
        if let Some(game) = self.channel_games.get(&channel_id.trim().to_lowercase()) {
            return NormalizedName::Canonical(game.clone());
        }
        let mut texts: Vec<&str> = vec![title];
        texts.extend(tags.iter().map(|t| t.as_str()));
        if let Some(game) = self.classify_text(&texts) {
            return NormalizedName::Canonical(game);
        }
        NormalizedName::unmapped_or_unknown(title)
    }

    /// Organizer from the first candidate label with an alias, else
    /// `unmapped:<fallback>`
    pub fn organizer_from(&self, candidates: &[&str], fallback: &str) -> NormalizedName {
        for candidate in candidates {
            let key = candidate.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            if let Some(canonical) = self.organizer_aliases.get(&key) {
                return NormalizedName::Canonical(canonical.clone());
            }
        }
        NormalizedName::unmapped_or_unknown(fallback)
    }

    /// Re-resolve a stored game name through the current map.
    ///
    /// Only `unmapped:` names can change; canonical and unknown pass through.
    pub fn resolve_stored_game(&self, stored: &str) -> String {
        match NormalizedName::from_stored(stored) {
            NormalizedName::Unmapped(raw) => self.game_from_category(&raw).to_stored(),
            _ => stored.to_string(),
        }
    }

    pub fn resolve_stored_organizer(&self, stored: &str) -> String {
        match NormalizedName::from_stored(stored) {
            NormalizedName::Unmapped(raw) => self.organizer_from(&[raw.as_str()], &raw).to_stored(),
            _ => stored.to_string(),
        }
    }

    fn classify_text(&self, texts: &[&str]) -> Option<String> {
        let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
        self.title_keywords
            .iter()
            .find(|(_, keywords)| {
                keywords
                    .iter()
                    .any(|k| lowered.iter().any(|text| contains_word(text, k)))
            })
            .map(|(game, _)| game.clone())
    }

    pub fn defaults() -> Self {
        Self::from_file_contents(default_identity_file())
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Substring match that does not start or end inside a word, so short
/// keywords like `cod` or `sc2` do not fire on unrelated words.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

fn entries(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(name, labels)| {
            (
                name.to_string(),
                labels.iter().map(|l| l.to_string()).collect(),
            )
        })
        .collect()
}

fn default_identity_file() -> IdentityFile {
    const LOL_ESPORTS_CHANNELS: &[&str] = &[
        "UCvqRdlKsE5Q8mf8YXbdIJLw",
        "UC48rkTlXjRd6pnqqBkdV0Mw",
        "UCHKuLpFy9q8XDp0i9WNHkDw",
    ];

    IdentityFile {
        games: entries(&[
            ("League of Legends", &["LoL"]),
            (
                "Counter-Strike",
                &["Counter-Strike 2", "Counter-Strike: Global Offensive", "CS:GO", "CS2"],
            ),
            (
                "PUBG: Battlegrounds",
                &["PLAYERUNKNOWN'S BATTLEGROUNDS", "PUBG"],
            ),
            ("Dota 2", &[]),
            ("Hearthstone", &[]),
            ("Overwatch", &["Overwatch 2"]),
            ("Heroes of the Storm", &[]),
            ("Rocket League", &[]),
            ("StarCraft II", &["StarCraft 2"]),
            ("Smite", &["SMITE 2"]),
            ("Street Fighter V", &[]),
            ("Call of Duty", &["Call of Duty: Warzone", "Call of Duty: Black Ops 6"]),
            ("Super Smash Bros. Melee", &[]),
            ("Destiny 2", &[]),
            ("Minecraft", &[]),
            ("FIFA", &["EA Sports FC 24", "EA Sports FC 25"]),
            ("Arena of Valor", &["Realm of Valor", "RoV"]),
        ]),
        organizers: entries(&[
            (
                "LoL Esports",
                &[
                    LOL_ESPORTS_CHANNELS[0],
                    LOL_ESPORTS_CHANNELS[1],
                    LOL_ESPORTS_CHANNELS[2],
                    "riotgames",
                    "lolesports",
                    "lck",
                    "lec",
                    "lcs",
                ],
            ),
            ("Valve", &["UCTQKT5QqO3h7y32G8VzuySQ", "dota2ti", "dota2ti_ru"]),
            ("Garena", &["UCy19QXxbCHh8qVVCbuGk-ig"]),
            ("ESL", &["esl_csgo", "eslcs", "esl_dota2"]),
            ("BLAST", &["blastpremier", "blast"]),
            ("PGL", &["pgl", "pgl_dota2"]),
        ]),
        title_keywords: entries(&[
            ("League of Legends", &["LCK", "LCS", "CBLoL", "League of Legends"]),
            ("Counter-Strike", &["CSGO", "CS GO", "CS:GO", "CS2", "Counter Strike"]),
            ("PUBG: Battlegrounds", &["PUBG", "Playerunknown", "battlegrounds"]),
            ("Dota 2", &["Dota 2", "dota"]),
            ("Hearthstone", &["Hearthstone"]),
            ("Overwatch", &["Overwatch"]),
            ("Heroes of the Storm", &["Heroes of the Storm", "HOTS"]),
            ("Rocket League", &["Rocket League"]),
            ("StarCraft II", &["sc2", "Starcraft"]),
            ("Smite", &["Smite"]),
            ("Street Fighter V", &["Street Fighter V", "Street Fighter 5"]),
            ("Call of Duty", &["COD", "Call of Duty", "Black Ops"]),
            ("Super Smash Bros. Melee", &["smash"]),
            ("Destiny 2", &["Destiny 2"]),
            ("Minecraft", &["Minecraft"]),
            ("FIFA", &["FIFA"]),
        ]),
        channel_games: entries(&[
            ("League of Legends", LOL_ESPORTS_CHANNELS),
            ("Dota 2", &["UCTQKT5QqO3h7y32G8VzuySQ"]),
            ("Arena of Valor", &["UCy19QXxbCHh8qVVCbuGk-ig"]),
        ]),
    }
}
