//! Wire envelopes for the broker API.
//!
//! This module contains:
//! - `Action` / `ResultCode`: wire discriminants with forward-compatible fallbacks
//! - `Request` / `RequestPayload`: outbound envelope and its typed payloads
//! - `Response` / `ResponsePayload`: inbound envelope with one variant per action
//! - `encode` / `decode`: the codec used by the publisher and the dispatcher

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod payloads;

pub use payloads::*;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Malformed '{action}' payload: {source}")]
    Payload {
        action: Action,
        #[source]
        source: serde_json::Error,
    },

    #[error("Action '{0}' cannot be sent")]
    Unencodable(Action),
}

// ============================================================================
// Discriminants
// ============================================================================

/// Correlation key used to match a response to the call that triggered it.
///
/// The API identifies responses by the user they concern, so the key is the
/// numeric user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub i64);

impl From<i64> for CorrelationKey {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Action discriminant carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    CreateAuthCode,
    GrantToken,
    AuthAdditionalOperation,
    GrantAdditionalOperation,
    AuthorizePayment,
    Pay,
    Payout,
    GetInfo,
    ViewCraftbook,
    RequestProfile,
    RequestBasicInfo,
    RequestGearInfo,
    RequestStock,
    GuildInfo,
    WantToBuy,
    /// Any action this client does not know about.
    UnknownAction,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateAuthCode => "createAuthCode",
            Action::GrantToken => "grantToken",
            Action::AuthAdditionalOperation => "authAdditionalOperation",
            Action::GrantAdditionalOperation => "grantAdditionalOperation",
            Action::AuthorizePayment => "authorizePayment",
            Action::Pay => "pay",
            Action::Payout => "payout",
            Action::GetInfo => "getInfo",
            Action::ViewCraftbook => "viewCraftbook",
            Action::RequestProfile => "requestProfile",
            Action::RequestBasicInfo => "requestBasicInfo",
            Action::RequestGearInfo => "requestGearInfo",
            Action::RequestStock => "requestStock",
            Action::GuildInfo => "guildInfo",
            Action::WantToBuy => "wantToBuy",
            Action::UnknownAction => "unknownAction",
        }
    }

    /// Parse a wire name. Unrecognized names map to `UnknownAction`.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "createAuthCode" => Action::CreateAuthCode,
            "grantToken" => Action::GrantToken,
            "authAdditionalOperation" => Action::AuthAdditionalOperation,
            "grantAdditionalOperation" => Action::GrantAdditionalOperation,
            "authorizePayment" => Action::AuthorizePayment,
            "pay" => Action::Pay,
            "payout" => Action::Payout,
            "getInfo" => Action::GetInfo,
            "viewCraftbook" => Action::ViewCraftbook,
            "requestProfile" => Action::RequestProfile,
            "requestBasicInfo" => Action::RequestBasicInfo,
            "requestGearInfo" => Action::RequestGearInfo,
            "requestStock" => Action::RequestStock,
            "guildInfo" => Action::GuildInfo,
            "wantToBuy" => Action::WantToBuy,
            _ => Action::UnknownAction,
        }
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Action::from_wire(&name)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultCode {
    /// Everything is fine.
    Ok,
    /// Amount is less than or equal to zero.
    BadAmount,
    /// The currency is not allowed.
    BadCurrency,
    /// Message format is bad: invalid JSON, wrong types or missing fields.
    BadFormat,
    /// The requested action does not exist.
    ActionNotFound,
    /// The user id is wrong or the user became inactive.
    NoSuchUser,
    /// The application is not registered yet.
    NotRegistered,
    /// Authorization code is incorrect.
    InvalidCode,
    /// Requested operation does not exist.
    NoSuchOperation,
    /// Temporary server difficulties; repeat the request.
    TryAgain,
    /// A transaction field or the confirmation code is wrong.
    AuthorizationFailed,
    /// Player or application balance is insufficient.
    InsufficientFunds,
    /// Player level is too low for this action.
    LevelIsLow,
    /// Player is not in the implied guild.
    NotInGuild,
    /// No such token, possibly revoked.
    InvalidToken,
    /// The token lacks rights for this action. The payload carries
    /// `requiredOperation`.
    Forbidden,
    /// Any result this client does not know about.
    UnknownResult,
}

impl ResultCode {
    /// Wire name of the result code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "Ok",
            ResultCode::BadAmount => "BadAmount",
            ResultCode::BadCurrency => "BadCurrency",
            ResultCode::BadFormat => "BadFormat",
            ResultCode::ActionNotFound => "ActionNotFound",
            ResultCode::NoSuchUser => "NoSuchUser",
            ResultCode::NotRegistered => "NotRegistered",
            ResultCode::InvalidCode => "InvalidCode",
            ResultCode::NoSuchOperation => "NoSuchOperation",
            ResultCode::TryAgain => "TryAgain",
            ResultCode::AuthorizationFailed => "AuthorizationFailed",
            ResultCode::InsufficientFunds => "InsufficientFunds",
            ResultCode::LevelIsLow => "LevelIsLow",
            ResultCode::NotInGuild => "NotInGuild",
            ResultCode::InvalidToken => "InvalidToken",
            ResultCode::Forbidden => "Forbidden",
            ResultCode::UnknownResult => "UnknownResult",
        }
    }

    /// Parse a wire name. Unrecognized names map to `UnknownResult`.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "Ok" => ResultCode::Ok,
            "BadAmount" => ResultCode::BadAmount,
            "BadCurrency" => ResultCode::BadCurrency,
            "BadFormat" => ResultCode::BadFormat,
            "ActionNotFound" => ResultCode::ActionNotFound,
            "NoSuchUser" => ResultCode::NoSuchUser,
            "NotRegistered" => ResultCode::NotRegistered,
            "InvalidCode" => ResultCode::InvalidCode,
            "NoSuchOperation" => ResultCode::NoSuchOperation,
            "TryAgain" => ResultCode::TryAgain,
            "AuthorizationFailed" => ResultCode::AuthorizationFailed,
            "InsufficientFunds" => ResultCode::InsufficientFunds,
            "LevelIsLow" => ResultCode::LevelIsLow,
            "NotInGuild" => ResultCode::NotInGuild,
            "InvalidToken" => ResultCode::InvalidToken,
            "Forbidden" => ResultCode::Forbidden,
            _ => ResultCode::UnknownResult,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

impl From<String> for ResultCode {
    fn from(name: String) -> Self {
        ResultCode::from_wire(&name)
    }
}

impl From<ResultCode> for String {
    fn from(result: ResultCode) -> Self {
        result.as_str().to_string()
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub action: Action,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(action: Action, payload: RequestPayload) -> Self {
        Self {
            token: None,
            action,
            payload,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Access request from the application to the user.
    pub fn create_auth_code(user_id: i64) -> Self {
        Self::new(
            Action::CreateAuthCode,
            RequestPayload::CreateAuthCode(ReqCreateAuthCode { user_id }),
        )
    }

    /// Exchange an auth code for an access token.
    pub fn grant_token(user_id: i64, auth_code: impl Into<String>) -> Self {
        Self::new(
            Action::GrantToken,
            RequestPayload::GrantToken(ReqGrantToken {
                user_id,
                auth_code: auth_code.into(),
            }),
        )
    }

    /// Ask the user to broaden the operation set of a token.
    pub fn auth_additional_operation(token: &str, operation: impl Into<String>) -> Self {
        Self::new(
            Action::AuthAdditionalOperation,
            RequestPayload::AuthAdditionalOperation(ReqAuthAdditionalOperation {
                operation: operation.into(),
            }),
        )
        .with_token(token)
    }

    /// Complete an `authAdditionalOperation` exchange.
    pub fn grant_additional_operation(
        token: &str,
        request_id: impl Into<String>,
        auth_code: impl Into<String>,
    ) -> Self {
        Self::new(
            Action::GrantAdditionalOperation,
            RequestPayload::GrantAdditionalOperation(ReqGrantAdditionalOperation {
                request_id: request_id.into(),
                auth_code: auth_code.into(),
            }),
        )
        .with_token(token)
    }

    /// Send the user a payment authorization with a confirmation code.
    pub fn authorize_payment(token: &str, transaction_id: impl Into<String>, pouches: i64) -> Self {
        Self::new(
            Action::AuthorizePayment,
            RequestPayload::AuthorizePayment(ReqAuthorizePayment {
                transaction_id: transaction_id.into(),
                amount: Amount::pouches(pouches),
            }),
        )
        .with_token(token)
    }

    /// Transfer the held amount from the user to the application balance.
    pub fn pay(
        token: &str,
        transaction_id: impl Into<String>,
        pouches: i64,
        confirmation_code: impl Into<String>,
    ) -> Self {
        Self::new(
            Action::Pay,
            RequestPayload::Pay(ReqPay {
                transaction_id: transaction_id.into(),
                amount: Amount::pouches(pouches),
                confirmation_code: confirmation_code.into(),
            }),
        )
        .with_token(token)
    }

    /// Transfer an amount from the application balance to the user.
    pub fn payout(
        token: &str,
        transaction_id: impl Into<String>,
        pouches: i64,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            Action::Payout,
            RequestPayload::Payout(ReqPayout {
                transaction_id: transaction_id.into(),
                amount: Amount::pouches(pouches),
                message: message.into(),
            }),
        )
        .with_token(token)
    }

    /// Current application info: balance, limits, status.
    pub fn get_info() -> Self {
        Self::new(Action::GetInfo, RequestPayload::Empty)
    }

    pub fn view_craftbook(token: &str) -> Self {
        Self::new(Action::ViewCraftbook, RequestPayload::Empty).with_token(token)
    }

    pub fn request_profile(token: &str) -> Self {
        Self::new(Action::RequestProfile, RequestPayload::Empty).with_token(token)
    }

    pub fn request_basic_info(token: &str) -> Self {
        Self::new(Action::RequestBasicInfo, RequestPayload::Empty).with_token(token)
    }

    pub fn request_gear_info(token: &str) -> Self {
        Self::new(Action::RequestGearInfo, RequestPayload::Empty).with_token(token)
    }

    pub fn request_stock(token: &str) -> Self {
        Self::new(Action::RequestStock, RequestPayload::Empty).with_token(token)
    }

    pub fn guild_info(token: &str) -> Self {
        Self::new(Action::GuildInfo, RequestPayload::Empty).with_token(token)
    }

    /// Buy something on the exchange.
    pub fn want_to_buy(
        token: &str,
        item_code: impl Into<String>,
        quantity: i64,
        price: i64,
        exact_price: bool,
    ) -> Self {
        Self::new(
            Action::WantToBuy,
            RequestPayload::WantToBuy(ReqWantToBuy {
                item_code: item_code.into(),
                quantity,
                price,
                exact_price,
            }),
        )
        .with_token(token)
    }
}

/// Encode an outbound envelope.
pub fn encode(
    action: Action,
    token: Option<&str>,
    payload: &RequestPayload,
) -> Result<Vec<u8>, ProtocolError> {
    if action == Action::UnknownAction {
        return Err(ProtocolError::Unencodable(action));
    }

    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<&'a str>,
        action: &'static str,
        payload: &'a RequestPayload,
    }

    Ok(serde_json::to_vec(&Wire {
        token,
        action: action.as_str(),
        payload,
    })?)
}

/// Encode a `Request`.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    encode(request.action, request.token.as_deref(), &request.payload)
}

// ============================================================================
// Inbound
// ============================================================================

/// Inbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub uuid: String,
    pub action: Action,
    pub result: ResultCode,
    /// Present on every payload; set for `Forbidden` results.
    pub required_operation: Option<String>,
    pub payload: ResponsePayload,
}

impl Response {
    /// Correlation key of this response, if its action carries an identity.
    ///
    /// Responses without an identity (`getInfo`, unknown actions, payloads
    /// missing `userId`) return `None` and never touch the registry.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        let user_id = match &self.payload {
            ResponsePayload::CreateAuthCode(p) => p.user_id,
            ResponsePayload::GrantToken(p) => p.user_id,
            ResponsePayload::AuthAdditionalOperation(p) => p.user_id,
            ResponsePayload::GrantAdditionalOperation(p) => p.user_id,
            ResponsePayload::AuthorizePayment(p) => p.user_id,
            ResponsePayload::Pay(p) => p.user_id,
            ResponsePayload::Payout(p) => p.user_id,
            ResponsePayload::ViewCraftbook(p) => p.user_id,
            ResponsePayload::RequestProfile(p) => p.user_id,
            ResponsePayload::RequestBasicInfo(p) => p.user_id,
            ResponsePayload::RequestGearInfo(p) => p.user_id,
            ResponsePayload::RequestStock(p) => p.user_id,
            ResponsePayload::GuildInfo(p) => p.user_id,
            ResponsePayload::WantToBuy(p) => p.user_id,
            ResponsePayload::GetInfo(_) | ResponsePayload::Unknown => None,
        };
        user_id.map(CorrelationKey)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Common fields, read before the variant payload.
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    uuid: String,
    action: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CommonPayload {
    #[serde(default)]
    required_operation: Option<String>,
}

/// Remove `null` object members, recursively, so defaulted fields decode to
/// their zero value.
pub(crate) fn prune_nulls(value: &mut Value) {
    match value {
        Value::Object(members) => {
            members.retain(|_, member| !member.is_null());
            members.values_mut().for_each(prune_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(prune_nulls),
        _ => {}
    }
}

/// Decode an inbound response envelope.
///
/// `null` fields are treated as absent.
pub fn decode(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let mut envelope: Value = serde_json::from_slice(bytes)?;
    prune_nulls(&mut envelope);
    let raw: RawResponse = serde_json::from_value(envelope)?;
    let action = Action::from_wire(&raw.action);

    let payload = if raw.payload.is_null() {
        Value::Object(Default::default())
    } else {
        raw.payload
    };

    let common: CommonPayload =
        serde_json::from_value(payload.clone()).map_err(|source| ProtocolError::Payload {
            action,
            source,
        })?;

    let variant = ResponsePayload::decode(action, payload)
        .map_err(|source| ProtocolError::Payload { action, source })?;

    Ok(Response {
        uuid: raw.uuid,
        action,
        result: ResultCode::from_wire(&raw.result),
        required_operation: common.required_operation,
        payload: variant,
    })
}
