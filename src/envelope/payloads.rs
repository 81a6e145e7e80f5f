//! Action-specific payload shapes.

use std::collections::HashMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::Action;

// ============================================================================
// Requests
// ============================================================================

/// Typed request payload, one variant per action that takes arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    CreateAuthCode(ReqCreateAuthCode),
    GrantToken(ReqGrantToken),
    AuthAdditionalOperation(ReqAuthAdditionalOperation),
    GrantAdditionalOperation(ReqGrantAdditionalOperation),
    AuthorizePayment(ReqAuthorizePayment),
    Pay(ReqPay),
    Payout(ReqPayout),
    WantToBuy(ReqWantToBuy),
    /// Token-only requests; serialized as `{}`.
    Empty,
}

impl Serialize for RequestPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestPayload::CreateAuthCode(p) => p.serialize(serializer),
            RequestPayload::GrantToken(p) => p.serialize(serializer),
            RequestPayload::AuthAdditionalOperation(p) => p.serialize(serializer),
            RequestPayload::GrantAdditionalOperation(p) => p.serialize(serializer),
            RequestPayload::AuthorizePayment(p) => p.serialize(serializer),
            RequestPayload::Pay(p) => p.serialize(serializer),
            RequestPayload::Payout(p) => p.serialize(serializer),
            RequestPayload::WantToBuy(p) => p.serialize(serializer),
            RequestPayload::Empty => serializer.serialize_map(Some(0))?.end(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqCreateAuthCode {
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqGrantToken {
    pub user_id: i64,
    pub auth_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReqAuthAdditionalOperation {
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqGrantAdditionalOperation {
    pub request_id: String,
    pub auth_code: String,
}

/// Payment amount; the API only accepts pouches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub pouches: i64,
}

impl Amount {
    pub fn pouches(pouches: i64) -> Self {
        Self { pouches }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqAuthorizePayment {
    pub transaction_id: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqPay {
    pub transaction_id: String,
    pub amount: Amount,
    pub confirmation_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqPayout {
    pub transaction_id: String,
    pub amount: Amount,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqWantToBuy {
    pub item_code: String,
    pub quantity: i64,
    pub price: i64,
    pub exact_price: bool,
}

// ============================================================================
// Responses
// ============================================================================

/// Typed response payload, selected by the envelope's action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    CreateAuthCode(ResCreateAuthCode),
    GrantToken(ResGrantToken),
    AuthAdditionalOperation(ResAuthAdditionalOperation),
    GrantAdditionalOperation(ResGrantAdditionalOperation),
    AuthorizePayment(ResAuthorizePayment),
    Pay(ResPay),
    Payout(ResPayout),
    GetInfo(ResGetInfo),
    ViewCraftbook(ResViewCraftbook),
    RequestProfile(ResRequestProfile),
    RequestBasicInfo(ResRequestBasicInfo),
    RequestGearInfo(ResRequestGearInfo),
    RequestStock(ResRequestStock),
    GuildInfo(ResGuildInfo),
    WantToBuy(ResWantToBuy),
    /// Payload of an action this client does not know; not preserved.
    Unknown,
}

impl ResponsePayload {
    /// Decode the variant selected by `action`.
    pub(super) fn decode(action: Action, payload: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        Ok(match action {
            Action::CreateAuthCode => Self::CreateAuthCode(from_value(payload)?),
            Action::GrantToken => Self::GrantToken(from_value(payload)?),
            Action::AuthAdditionalOperation => Self::AuthAdditionalOperation(from_value(payload)?),
            Action::GrantAdditionalOperation => {
                Self::GrantAdditionalOperation(from_value(payload)?)
            }
            Action::AuthorizePayment => Self::AuthorizePayment(from_value(payload)?),
            Action::Pay => Self::Pay(from_value(payload)?),
            Action::Payout => Self::Payout(from_value(payload)?),
            Action::GetInfo => Self::GetInfo(from_value(payload)?),
            Action::ViewCraftbook => Self::ViewCraftbook(from_value(payload)?),
            Action::RequestProfile => Self::RequestProfile(from_value(payload)?),
            Action::RequestBasicInfo => Self::RequestBasicInfo(from_value(payload)?),
            Action::RequestGearInfo => Self::RequestGearInfo(from_value(payload)?),
            Action::RequestStock => Self::RequestStock(from_value(payload)?),
            Action::GuildInfo => Self::GuildInfo(from_value(payload)?),
            Action::WantToBuy => Self::WantToBuy(from_value(payload)?),
            Action::UnknownAction => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResCreateAuthCode {
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResGrantToken {
    pub user_id: Option<i64>,
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResAuthAdditionalOperation {
    pub operation: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResGrantAdditionalOperation {
    pub request_id: String,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResAuthorizePayment {
    pub fee: HashMap<String, i64>,
    pub debit: HashMap<String, i64>,
    pub user_id: Option<i64>,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResPay {
    pub fee: HashMap<String, i64>,
    pub debit: HashMap<String, i64>,
    pub user_id: Option<i64>,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResPayout {
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResGetInfo {
    pub balance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CraftRecord {
    pub id: String,
    pub name: String,
    pub price: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResViewCraftbook {
    pub alchemy: Vec<CraftRecord>,
    pub craft: Vec<CraftRecord>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Profile {
    pub user_name: String,
    pub castle: String,
    #[serde(rename = "lvl")]
    pub level: i64,
    #[serde(rename = "exp")]
    pub experience: i64,
    #[serde(rename = "atk")]
    pub attack: i64,
    #[serde(rename = "def")]
    pub defense: i64,
    pub gold: i64,
    pub pouches: i64,
    pub guild: String,
    #[serde(rename = "guild_tag")]
    pub guild_tag: String,
    pub class: String,
    pub mana: i64,
    pub stamina: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResRequestProfile {
    pub profile: Option<Profile>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicProfile {
    pub class: String,
    #[serde(rename = "atk")]
    pub attack: i64,
    #[serde(rename = "def")]
    pub defense: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResRequestBasicInfo {
    pub profile: Option<BasicProfile>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResRequestGearInfo {
    pub gear: HashMap<String, String>,
    pub ammo: HashMap<String, i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResRequestStock {
    pub stock: HashMap<String, i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResGuildInfo {
    pub tag: String,
    pub level: i64,
    pub castle: String,
    pub glory: i64,
    pub members: i64,
    pub name: String,
    pub lobby: String,
    pub stock_size: i64,
    pub stock_limit: i64,
    pub stock: HashMap<String, i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResWantToBuy {
    pub item_code: String,
    pub quantity: i64,
    pub user_id: Option<i64>,
}
