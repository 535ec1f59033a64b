use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A locally cached folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub unread_count: u32,
    pub flagged_count: u32,
    pub visible_limit: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_pushed: Option<DateTime<Utc>>,
    pub status: Option<String>,
    /// Opaque state owned by the push implementation.
    pub push_state: Option<String>,
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub personal: Option<String>,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Address {
            address: address.into(),
            personal: None,
        }
    }

    pub fn with_personal(address: impl Into<String>, personal: impl Into<String>) -> Self {
        Address {
            address: address.into(),
            personal: Some(personal.into()),
        }
    }

    /// Pack a list into the single-column form: `addr[;personal]` entries,
    /// comma separated, each component percent-encoded. Empty lists pack to `None`.
    pub fn pack(addresses: &[Address]) -> Option<String> {
        if addresses.is_empty() {
            return None;
        }
        let packed = addresses
            .iter()
            .map(|a| match &a.personal {
                Some(p) => format!(
                    "{};{}",
                    urlencoding::encode(&a.address),
                    urlencoding::encode(p)
                ),
                None => urlencoding::encode(&a.address).into_owned(),
            })
            .collect::<Vec<_>>()
            .join(",");
        Some(packed)
    }

    /// Inverse of [`Address::pack`]. Undecodable entries are skipped.
    pub fn unpack(packed: Option<&str>) -> Vec<Address> {
        let packed = match packed {
            Some(p) if !p.is_empty() => p,
            _ => return Vec::new(),
        };
        packed
            .split(',')
            .filter_map(|entry| {
                let (addr, personal) = match entry.split_once(';') {
                    Some((a, p)) => (a, Some(p)),
                    None => (entry, None),
                };
                let address = urlencoding::decode(addr).ok()?.into_owned();
                let personal = match personal {
                    Some(p) => Some(urlencoding::decode(p).ok()?.into_owned()),
                    None => None,
                };
                Some(Address { address, personal })
            })
            .collect()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.personal {
            Some(p) => write!(f, "{p} <{}>", self.address),
            None => f.write_str(&self.address),
        }
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Named boolean message attribute. Anything not in the fixed vocabulary is
/// kept as an upper-cased `Custom` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Flagged,
    Answered,
    Draft,
    Deleted,
    XDestroyed,
    XDownloadedFull,
    XDownloadedPartial,
    XGotAllHeaders,
    XBadFlag,
    Custom(String),
}

impl Flag {
    pub fn token(&self) -> &str {
        match self {
            Flag::Seen => "SEEN",
            Flag::Flagged => "FLAGGED",
            Flag::Answered => "ANSWERED",
            Flag::Draft => "DRAFT",
            Flag::Deleted => "DELETED",
            Flag::XDestroyed => "X_DESTROYED",
            Flag::XDownloadedFull => "X_DOWNLOADED_FULL",
            Flag::XDownloadedPartial => "X_DOWNLOADED_PARTIAL",
            Flag::XGotAllHeaders => "X_GOT_ALL_HEADERS",
            Flag::XBadFlag => "X_BAD_FLAG",
            Flag::Custom(token) => token,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Flag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase();
        Ok(match token.as_str() {
            "SEEN" => Flag::Seen,
            "FLAGGED" => Flag::Flagged,
            "ANSWERED" => Flag::Answered,
            "DRAFT" => Flag::Draft,
            "DELETED" => Flag::Deleted,
            "X_DESTROYED" => Flag::XDestroyed,
            "X_DOWNLOADED_FULL" => Flag::XDownloadedFull,
            "X_DOWNLOADED_PARTIAL" => Flag::XDownloadedPartial,
            "X_GOT_ALL_HEADERS" => Flag::XGotAllHeaders,
            "X_BAD_FLAG" => Flag::XBadFlag,
            _ => Flag::Custom(token),
        })
    }
}

/// Exact flag set of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    pub fn new() -> Self {
        Flags::default()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    /// Returns true if the set changed.
    pub fn set(&mut self, flag: Flag, value: bool) -> bool {
        if value {
            self.0.insert(flag)
        } else {
            self.0.remove(&flag)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Neither DELETED nor X_DESTROYED: the message counts toward folder totals.
    pub fn is_live(&self) -> bool {
        !self.contains(&Flag::Deleted) && !self.contains(&Flag::XDestroyed)
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        Flags(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Multi-valued header map. Name order and per-name value order are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(IndexMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// Replace every value of `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    pub fn get(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) {
        self.0.shift_remove(name);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every (name, value) pair.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Messages as handed to the store
// ---------------------------------------------------------------------------

/// A displayable body part. `text/html` parts feed the HTML column, anything
/// else is treated as plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewable {
    pub mime_type: String,
    pub text: String,
}

impl Viewable {
    pub fn plain(text: impl Into<String>) -> Self {
        Viewable {
            mime_type: "text/plain".into(),
            text: text.into(),
        }
    }

    pub fn html(text: impl Into<String>) -> Self {
        Viewable {
            mime_type: "text/html".into(),
            text: text.into(),
        }
    }

    pub fn is_html(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("text/html")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum AttachmentBody {
    /// Not downloaded yet.
    #[default]
    Missing,
    /// Bytes available in memory, to be written to the attachment directory.
    Bytes(Vec<u8>),
    /// Already stored locally under this locator.
    Stored(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentPart {
    /// Row id when this part was loaded from the store; updates keep it.
    pub id: Option<i64>,
    pub mime_type: String,
    pub name: Option<String>,
    pub content_id: Option<String>,
    pub content_disposition: Option<String>,
    /// Opaque locator the sync layer uses to fetch the bytes again.
    pub store_data: Option<String>,
    pub body: AttachmentBody,
}

/// Plain message value. It is compiled into its column representation only
/// when the store writes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub uid: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub sent_date: Option<DateTime<Utc>>,
    pub internal_date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub flags: Flags,
    pub headers: Headers,
    pub body: Vec<Viewable>,
    pub attachments: Vec<AttachmentPart>,
}

impl Message {
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Message {
            uid: Some(uid.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Messages as read back
// ---------------------------------------------------------------------------

/// Per-message header cache. Headers are fetched on first access.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum HeaderState {
    #[default]
    Unloaded,
    Loaded(Headers),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub id: i64,
    /// Non-owning reference; resolve with `LocalStore::open_folder_by_id`.
    pub folder_id: i64,
    pub uid: String,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub sent_date: Option<DateTime<Utc>>,
    pub internal_date: Option<DateTime<Utc>>,
    pub flags: Flags,
    pub deleted: bool,
    pub attachment_count: u32,
    pub message_id: Option<String>,
    pub preview: Option<String>,
    pub(crate) headers: HeaderState,
}

impl LocalMessage {
    pub fn is_set(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    pub fn header_state(&self) -> &HeaderState {
        &self.headers
    }

    /// Null the content columns the way a tombstone stores them.
    pub(crate) fn clear_content(&mut self) {
        self.subject = None;
        self.from.clear();
        self.to.clear();
        self.cc.clear();
        self.bcc.clear();
        self.reply_to.clear();
        self.sent_date = None;
        self.preview = None;
        self.attachment_count = 0;
        self.headers = HeaderState::Loaded(Headers::new());
    }
}

/// Stored body columns of a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredContent {
    pub text: Option<String>,
    pub html: Option<String>,
    pub preview: Option<String>,
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub store_data: Option<String>,
    pub content_uri: Option<String>,
    pub size: u64,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub content_id: Option<String>,
    pub content_disposition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: Option<String>,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Pending commands
// ---------------------------------------------------------------------------

/// A deferred remote operation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: i64,
    pub command: String,
    pub arguments: Vec<String>,
}

impl fmt::Display for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.command, self.arguments.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Columns free text can be matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Subject,
    Sender,
    To,
    Cc,
    TextContent,
    HtmlContent,
    Preview,
}

impl SearchField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            SearchField::Subject => "subject",
            SearchField::Sender => "sender_list",
            SearchField::To => "to_list",
            SearchField::Cc => "cc_list",
            SearchField::TextContent => "text_content",
            SearchField::HtmlContent => "html_content",
            SearchField::Preview => "preview",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub fields: Vec<SearchField>,
    pub folder_ids: Vec<i64>,
    /// Explicit (uid, folder id) pairs.
    pub messages: Vec<(String, i64)>,
    pub required_flags: Vec<Flag>,
    pub forbidden_flags: Vec<Flag>,
}

/// Receives query results as they stream out of the store.
pub trait MessageRetrievalListener {
    fn message_finished(&mut self, message: &LocalMessage, index: usize);
    fn messages_finished(&mut self, total: usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_list_survives_separators() {
        let list = vec![
            Address::with_personal("a@example.com", "Doe, Jane; PhD"),
            Address::new("b@example.com"),
        ];
        let packed = Address::pack(&list).expect("non-empty list packs");
        assert_eq!(packed.matches(',').count(), 1);
        assert_eq!(Address::unpack(Some(&packed)), list);
        assert_eq!(Address::pack(&[]), None);
        assert!(Address::unpack(None).is_empty());
    }

    #[test]
    fn unknown_flag_tokens_become_custom() {
        assert_eq!("seen".parse::<Flag>().unwrap(), Flag::Seen);
        assert_eq!(
            "$label1".parse::<Flag>().unwrap(),
            Flag::Custom("$LABEL1".into())
        );
    }

    #[test]
    fn headers_keep_insertion_order() {
        let mut h = Headers::new();
        h.add("Received", "one");
        h.add("From", "a@example.com");
        h.add("Received", "two");
        assert_eq!(h.get("Received"), ["one", "two"]);
        assert_eq!(h.names().collect::<Vec<_>>(), ["Received", "From"]);
        h.set("Received", "three");
        assert_eq!(h.get("Received"), ["three"]);
        h.remove("Received");
        assert!(h.get("Received").is_empty());
    }

    #[test]
    fn liveness_tracks_tombstone_flags() {
        let mut flags = Flags::new();
        assert!(flags.is_live());
        flags.set(Flag::XDestroyed, true);
        assert!(!flags.is_live());
    }
}
