//! Public broadcast feeds.
//!
//! Feeds carry no request/response identity; each is an ordered stream of
//! events published by the game to a per-client queue named
//! `{feed_prefix}{kind}`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{prune_nulls, ProtocolError};

/// Feed kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    Deals,
    Duels,
    Offers,
    SexDigest,
    YellowPages,
    AuDigest,
}

impl Feed {
    pub const ALL: [Feed; 6] = [
        Feed::Deals,
        Feed::Duels,
        Feed::Offers,
        Feed::SexDigest,
        Feed::YellowPages,
        Feed::AuDigest,
    ];

    /// Queue suffix of this feed.
    pub fn suffix(&self) -> &'static str {
        match self {
            Feed::Deals => "deals",
            Feed::Duels => "duels",
            Feed::Offers => "offers",
            Feed::SexDigest => "sex_digest",
            Feed::YellowPages => "yellow_pages",
            Feed::AuDigest => "au_digest",
        }
    }
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// An event type carried by one feed.
pub trait FeedEvent: DeserializeOwned + Send + 'static {
    const FEED: Feed;

    /// Decode a message body; `null` fields take their defaults.
    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut value: serde_json::Value = serde_json::from_slice(body)?;
        prune_nulls(&mut value);
        Ok(serde_json::from_value(value)?)
    }
}

// ============================================================================
// Deals
// ============================================================================

/// A completed exchange deal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Deal {
    pub seller_id: String,
    pub seller_castle: String,
    pub seller_name: String,
    pub buyer_id: String,
    pub buyer_castle: String,
    pub buyer_name: String,
    pub item: String,
    #[serde(rename = "qty")]
    pub quantity: i64,
    pub price: i64,
}

impl FeedEvent for Deal {
    const FEED: Feed = Feed::Deals;
}

// ============================================================================
// Duels
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Duelist {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub castle: String,
    pub level: i64,
    pub hp: i64,
}

/// Outcome of an arena duel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Duel {
    pub winner: Option<Duelist>,
    pub loser: Option<Duelist>,
    pub is_challenge: bool,
    pub is_guild_duel: bool,
}

impl FeedEvent for Duel {
    const FEED: Feed = Feed::Duels;
}

// ============================================================================
// Offers
// ============================================================================

/// A new sell offer on the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Offer {
    pub seller_id: String,
    pub seller_castle: String,
    pub seller_name: String,
    pub item: String,
    #[serde(rename = "qty")]
    pub quantity: i64,
    pub price: i64,
}

impl FeedEvent for Offer {
    const FEED: Feed = Feed::Offers;
}

// ============================================================================
// Exchange digest
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SexDigestItem {
    pub name: String,
    pub prices: Vec<i64>,
}

/// Periodic exchange price digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SexDigest(pub Vec<SexDigestItem>);

impl FeedEvent for SexDigest {
    const FEED: Feed = Feed::SexDigest;
}

// ============================================================================
// Yellow pages
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Specialization {
    pub gloves: i64,
    pub coat: i64,
    pub helmet: i64,
    pub boots: i64,
    pub armor: i64,
    pub weapon: i64,
    pub shield: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferItem {
    pub item: String,
    pub price: i64,
    pub mana: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct YellowPage {
    pub link: String,
    pub name: String,
    pub owner_name: String,
    pub owner_castle: String,
    pub kind: String,
    pub mana: i64,
    pub offers: Vec<OfferItem>,
    pub specialization: Option<Specialization>,
    pub guild_discount: i64,
    pub castle_discount: i64,
}

/// Snapshot of open shops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct YellowPages(pub Vec<YellowPage>);

impl FeedEvent for YellowPages {
    const FEED: Feed = Feed::YellowPages;
}

// ============================================================================
// Auction digest
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuctionDigestItem {
    pub lot_id: String,
    pub item_name: String,
    pub seller_name: String,
    pub quality: Option<String>,
    pub seller_castle: String,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "endAt")]
    pub ended_at: Option<DateTime<Utc>>,
    pub buyer_castle: Option<String>,
    pub status: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub buyer_name: Option<String>,
    pub price: i64,
    pub stats: HashMap<String, i64>,
}

/// Periodic auction digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionDigest(pub Vec<AuctionDigestItem>);

impl FeedEvent for AuctionDigest {
    const FEED: Feed = Feed::AuDigest;
}
