use url::form_urlencoded;
use url::Url;

/// The URL query parameter carrying the selected known-database id.
pub const SELECTED_KNOWN_DATABASE_QUERY_KEY: &str = "dexie-db";

/// Somewhere a query string lives: the address bar, a hash route, a test double.
pub trait QueryLocation {
    /// The current query string, without a leading `?`.
    fn query(&self) -> String;
    fn replace_query(&mut self, query: &str);
}

/// Query string of a full URL (`https://app/?dexie-db=…`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLocation {
    url: Url,
}

impl UrlLocation {
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: Url::parse(raw)?,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl QueryLocation for UrlLocation {
    fn query(&self) -> String {
        self.url.query().unwrap_or_default().to_string()
    }

    fn replace_query(&mut self, query: &str) {
        if query.is_empty() {
            self.url.set_query(None);
        } else {
            self.url.set_query(Some(query));
        }
    }
}

/// Query string carried in a hash route (`#?dexie-db=…`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashLocation {
    hash: String,
}

impl HashLocation {
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl QueryLocation for HashLocation {
    fn query(&self) -> String {
        strip_query_prefix(&self.hash).to_string()
    }

    fn replace_query(&mut self, query: &str) {
        self.hash = if query.is_empty() {
            String::new()
        } else {
            format!("#?{query}")
        };
    }
}

/// In-memory query string; what the headless binary and the tests use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLocation {
    query: String,
}

impl MemoryLocation {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: strip_query_prefix(&query.into()).to_string(),
        }
    }
}

impl QueryLocation for MemoryLocation {
    fn query(&self) -> String {
        self.query.clone()
    }

    fn replace_query(&mut self, query: &str) {
        self.query = strip_query_prefix(query).to_string();
    }
}

/// Reads the selected id from a query string; a leading `#` or `?` is tolerated.
#[must_use]
pub fn read_selected_id_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(strip_query_prefix(query).as_bytes())
        .find(|(key, _)| key == SELECTED_KNOWN_DATABASE_QUERY_KEY)
        .and_then(|(_, value)| normalize_id_str(&value))
}

/// Returns `query` with the selected-id parameter set to `id`, or removed when `id`
/// is `None`. Other parameters keep their order.
#[must_use]
pub fn with_selected_id_in_query(query: &str, id: Option<&str>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    let mut written = false;

    for (key, value) in form_urlencoded::parse(strip_query_prefix(query).as_bytes()) {
        if key != SELECTED_KNOWN_DATABASE_QUERY_KEY {
            serializer.append_pair(&key, &value);
            continue;
        }
        if let (Some(id), false) = (id, written) {
            serializer.append_pair(SELECTED_KNOWN_DATABASE_QUERY_KEY, id);
            written = true;
        }
    }

    if let (Some(id), false) = (id, written) {
        serializer.append_pair(SELECTED_KNOWN_DATABASE_QUERY_KEY, id);
    }

    serializer.finish()
}

pub(crate) fn normalize_id_str(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn strip_query_prefix(raw: &str) -> &str {
    let raw = raw.strip_prefix('#').unwrap_or(raw);
    raw.strip_prefix('?').unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::{
        read_selected_id_from_query, with_selected_id_in_query, HashLocation, MemoryLocation,
        QueryLocation, UrlLocation,
    };

    #[test]
    fn reads_selected_id_from_query_and_hash_forms() {
        assert_eq!(
            read_selected_id_from_query("dexie-db=abc&view=tables").as_deref(),
            Some("abc")
        );
        assert_eq!(
            read_selected_id_from_query("?dexie-db=%20abc%20").as_deref(),
            Some("abc")
        );
        assert_eq!(
            read_selected_id_from_query("#?view=x&dexie-db=42").as_deref(),
            Some("42")
        );
        assert_eq!(read_selected_id_from_query("dexie-db="), None);
        assert_eq!(read_selected_id_from_query(""), None);
    }

    #[test]
    fn rewriting_query_preserves_other_parameters() {
        assert_eq!(
            with_selected_id_in_query("view=tables&dexie-db=old", Some("new")),
            "view=tables&dexie-db=new"
        );
        assert_eq!(
            with_selected_id_in_query("view=tables", Some("id-1")),
            "view=tables&dexie-db=id-1"
        );
        assert_eq!(
            with_selected_id_in_query("dexie-db=old&view=tables", None),
            "view=tables"
        );
    }

    #[test]
    fn url_location_round_trips_query() {
        let mut location =
            UrlLocation::parse("https://browser.local/app?dexie-db=one").expect("valid URL");
        assert_eq!(location.query(), "dexie-db=one");

        location.replace_query("dexie-db=two");
        assert_eq!(
            location.url().as_str(),
            "https://browser.local/app?dexie-db=two"
        );

        location.replace_query("");
        assert_eq!(location.url().as_str(), "https://browser.local/app");
    }

    #[test]
    fn hash_and_memory_locations_strip_prefixes() {
        let mut hash = HashLocation::new("#?dexie-db=one");
        assert_eq!(hash.query(), "dexie-db=one");
        hash.replace_query("dexie-db=two");
        assert_eq!(hash.hash(), "#?dexie-db=two");

        let memory = MemoryLocation::new("?dexie-db=three");
        assert_eq!(memory.query(), "dexie-db=three");
    }
}
