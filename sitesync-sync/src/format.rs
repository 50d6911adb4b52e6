//! Backend file (de)serialization.
//!
//! - `Markdown`: YAML front matter (`id`, `type`, `title`, then metadata) and
//!   the body.
//! - `Json` / `Yaml`: one object holding `id`, `title` and the metadata.
//! - `YamlMenu`: like `Yaml`, with `page_id` links stored as site URLs.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use sitesync_core::{ConfigItem, ContentId, ContentItem, FileFormat, SiteConfig};

use crate::error::SyncError;
use crate::paths::page_url;

const ID_KEY: &str = "id";
const TYPE_KEY: &str = "type";
const TITLE_KEY: &str = "title";
const PAGE_LINK_KEY: &str = "page_id";
const URL_LINK_KEY: &str = "url";

// ---------------------------------------------------------------------------
// LinkMap
// ---------------------------------------------------------------------------

/// Bidirectional page id ↔ URL map used for menu rewriting.
#[derive(Debug, Clone, Default)]
pub struct LinkMap {
    to_url: BTreeMap<ContentId, String>,
    to_id: BTreeMap<String, ContentId>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs of every active page item.
    pub fn from_items(config: &SiteConfig, items: &[ContentItem]) -> Self {
        let mut links = Self::new();
        for item in items.iter().filter(|i| !i.is_deleted()) {
            if let Some(ConfigItem::Page { .. }) = config.item_for(&item.content_type) {
                links.insert(item.id.clone(), page_url(item));
            }
        }
        links
    }

    pub fn insert(&mut self, id: ContentId, url: String) {
        self.to_id.insert(url.clone(), id.clone());
        self.to_url.insert(id, url);
    }

    pub fn url_for(&self, id: &str) -> Option<&str> {
        self.to_url.get(&ContentId::from(id)).map(String::as_str)
    }

    pub fn id_for(&self, url: &str) -> Option<&ContentId> {
        self.to_id.get(url)
    }

    /// Replace known `page_id` links with `url` links.
    pub fn to_urls(&self, value: &mut Value) {
        rewrite(value, &|obj| {
            let Some(url) = obj
                .get(PAGE_LINK_KEY)
                .and_then(Value::as_str)
                .and_then(|id| self.url_for(id))
            else {
                return;
            };
            let url = url.to_string();
            obj.remove(PAGE_LINK_KEY);
            obj.insert(URL_LINK_KEY.to_string(), Value::String(url));
        });
    }

    /// Replace `url` links that point at known pages with `page_id` links.
    pub fn to_ids(&self, value: &mut Value) {
        rewrite(value, &|obj| {
            let Some(id) = obj
                .get(URL_LINK_KEY)
                .and_then(Value::as_str)
                .and_then(|url| self.id_for(url))
            else {
                return;
            };
            let id = id.0.clone();
            obj.remove(URL_LINK_KEY);
            obj.insert(PAGE_LINK_KEY.to_string(), Value::String(id));
        });
    }
}

fn rewrite(value: &mut Value, apply: &dyn Fn(&mut Map<String, Value>)) {
    match value {
        Value::Object(obj) => {
            apply(obj);
            for child in obj.values_mut() {
                rewrite(child, apply);
            }
        }
        Value::Array(items) => {
            for child in items {
                rewrite(child, apply);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Parsed file
// ---------------------------------------------------------------------------

/// Fields recovered from a backend file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub id: ContentId,
    /// `type` from markdown front matter, when present.
    pub content_type: Option<String>,
    pub title: String,
    pub metadata: BTreeMap<String, Value>,
    pub body: String,
}

fn malformed(path: &str, reason: impl Into<String>) -> SyncError {
    SyncError::Malformed {
        path: path.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Serialize
// ---------------------------------------------------------------------------

pub fn serialize(item: &ContentItem, format: FileFormat, links: &LinkMap) -> Result<String, SyncError> {
    match format {
        FileFormat::Markdown => serialize_markdown(item),
        FileFormat::Json => {
            let mut out = serde_json::to_string_pretty(&data_object(item, None))?;
            out.push('\n');
            Ok(out)
        }
        FileFormat::Yaml => Ok(serde_yaml::to_string(&data_object(item, None))?),
        FileFormat::YamlMenu => Ok(serde_yaml::to_string(&data_object(item, Some(links)))?),
    }
}

fn serialize_markdown(item: &ContentItem) -> Result<String, SyncError> {
    let mut front = serde_yaml::Mapping::new();
    front.insert(ID_KEY.into(), item.id.0.clone().into());
    front.insert(TYPE_KEY.into(), item.content_type.clone().into());
    front.insert(TITLE_KEY.into(), item.title.clone().into());
    for (key, value) in &item.metadata {
        if matches!(key.as_str(), ID_KEY | TYPE_KEY | TITLE_KEY) {
            continue;
        }
        front.insert(key.clone().into(), serde_yaml::to_value(value)?);
    }
    let body = item.body.replace("\r\n", "\n");
    Ok(format!("---\n{}---\n{}", serde_yaml::to_string(&front)?, body))
}

fn data_object(item: &ContentItem, links: Option<&LinkMap>) -> Value {
    let mut obj = Map::new();
    for (key, value) in &item.metadata {
        obj.insert(key.clone(), value.clone());
    }
    obj.insert(ID_KEY.to_string(), Value::String(item.id.0.clone()));
    if !item.title.is_empty() {
        obj.insert(TITLE_KEY.to_string(), Value::String(item.title.clone()));
    }
    let mut value = Value::Object(obj);
    if let Some(links) = links {
        links.to_urls(&mut value);
    }
    value
}

// ---------------------------------------------------------------------------
// Deserialize
// ---------------------------------------------------------------------------

pub fn deserialize(
    path: &str,
    content: &str,
    format: FileFormat,
    links: &LinkMap,
) -> Result<ParsedFile, SyncError> {
    let content = content.replace("\r\n", "\n");
    match format {
        FileFormat::Markdown => {
            let (front, body) = split_front_matter(&content)
                .ok_or_else(|| malformed(path, "missing front matter"))?;
            let fields: BTreeMap<String, Value> = if front.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(front).map_err(|e| malformed(path, e.to_string()))?
            };
            parsed_from_fields(path, fields, body.to_string())
        }
        FileFormat::Json => {
            let fields = serde_json::from_str(&content).map_err(|e| malformed(path, e.to_string()))?;
            parsed_from_fields(path, fields, String::new())
        }
        FileFormat::Yaml | FileFormat::YamlMenu => {
            let mut value: Value =
                serde_yaml::from_str(&content).map_err(|e| malformed(path, e.to_string()))?;
            if format == FileFormat::YamlMenu {
                links.to_ids(&mut value);
            }
            let fields = serde_json::from_value(value).map_err(|e| malformed(path, e.to_string()))?;
            parsed_from_fields(path, fields, String::new())
        }
    }
}

/// `(front matter, body)` of a `---`-delimited markdown document.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    if let Some(body) = rest.strip_prefix("---\n") {
        return Some(("", body));
    }
    if let Some(end) = rest.find("\n---\n") {
        return Some((&rest[..=end], &rest[end + 5..]));
    }
    rest.strip_suffix("\n---").map(|front| (front, ""))
}

fn parsed_from_fields(
    path: &str,
    mut fields: BTreeMap<String, Value>,
    body: String,
) -> Result<ParsedFile, SyncError> {
    let id = match fields.remove(ID_KEY) {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(malformed(path, "missing id")),
    };
    let content_type = match fields.remove(TYPE_KEY) {
        Some(Value::String(t)) => Some(t),
        _ => None,
    };
    let title = match fields.remove(TITLE_KEY) {
        Some(Value::String(t)) => t,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Ok(ParsedFile {
        id: ContentId::from(id),
        content_type,
        title,
        metadata: fields,
        body,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page() -> ContentItem {
        let mut item = ContentItem::new("agency", "launch", "page");
        item.dirpath = "news".into();
        item.filename = "launch".into();
        item.title = "Launch day".into();
        item.body = "# Hello\n\nBody text.\n".into();
        item.metadata.insert("weight".into(), json!(3));
        item.metadata.insert("tags".into(), json!(["a", "b"]));
        item
    }

    #[test]
    fn markdown_front_matter_leads_with_identity() {
        let out = serialize(&page(), FileFormat::Markdown, &LinkMap::new()).unwrap();
        assert!(out.starts_with("---\nid: launch\ntype: page\ntitle: Launch day\n"));
        assert!(out.ends_with("---\n# Hello\n\nBody text.\n"));
    }

    #[test]
    fn markdown_parse_recovers_fields() {
        let item = page();
        let out = serialize(&item, FileFormat::Markdown, &LinkMap::new()).unwrap();
        let parsed = deserialize("content/news/launch.md", &out, FileFormat::Markdown, &LinkMap::new()).unwrap();
        assert_eq!(parsed.id, item.id);
        assert_eq!(parsed.content_type.as_deref(), Some("page"));
        assert_eq!(parsed.title, item.title);
        assert_eq!(parsed.metadata, item.metadata);
        assert_eq!(parsed.body, item.body);
    }

    #[test]
    fn markdown_without_front_matter_or_id_is_malformed() {
        let links = LinkMap::new();
        assert!(matches!(
            deserialize("a.md", "# no front matter", FileFormat::Markdown, &links),
            Err(SyncError::Malformed { .. })
        ));
        assert!(deserialize("a.md", "---\ntitle: x\n---\nbody", FileFormat::Markdown, &links).is_err());
        let parsed = deserialize("a.md", "---\nid: 42\n---", FileFormat::Markdown, &links).unwrap();
        assert_eq!(parsed.id, ContentId::from("42"));
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn crlf_files_parse() {
        let parsed = deserialize(
            "a.md",
            "---\r\nid: a\r\ntitle: A\r\n---\r\nline\r\n",
            FileFormat::Markdown,
            &LinkMap::new(),
        )
        .unwrap();
        assert_eq!(parsed.body, "line\n");
    }

    #[test]
    fn json_data_file_carries_id_and_metadata() {
        let mut item = ContentItem::new("agency", "settings", "settings");
        item.metadata.insert("theme".into(), json!("dark"));
        let out = serialize(&item, FileFormat::Json, &LinkMap::new()).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value, json!({"id": "settings", "theme": "dark"}));
    }

    #[test]
    fn menu_links_become_urls_and_back() {
        let mut links = LinkMap::new();
        links.insert(ContentId::from("launch"), "/news/launch/".into());

        let mut menu = ContentItem::new("agency", "nav", "navigation");
        menu.metadata.insert(
            "menu".into(),
            json!([
                {"name": "Launch", "page_id": "launch"},
                {"name": "External", "url": "https://example.gov"},
                {"name": "Missing", "page_id": "ghost"},
            ]),
        );

        let out = serialize(&menu, FileFormat::YamlMenu, &links).unwrap();
        assert!(out.contains("url: /news/launch/"));
        assert!(!out.contains("page_id: launch"));
        assert!(out.contains("page_id: ghost"));

        let parsed = deserialize("data/navigation.yml", &out, FileFormat::YamlMenu, &links).unwrap();
        assert_eq!(parsed.metadata, menu.metadata);
    }

    #[test]
    fn link_map_skips_deleted_and_data_items() {
        let config = SiteConfig::default();
        let mut deleted = page();
        deleted.id = ContentId::from("old");
        deleted.status = sitesync_core::ContentStatus::SoftDeleted;
        let data = ContentItem::new("agency", "nav", "navigation");
        let links = LinkMap::from_items(&config, &[page(), deleted, data]);
        assert_eq!(links.url_for("launch"), Some("/news/launch/"));
        assert_eq!(links.url_for("old"), None);
        assert_eq!(links.url_for("nav"), None);
    }
}
