//! Declarative content-type → file mapping for a site.
//!
//! ```yaml
//! content_root: content
//! items:
//!   - kind: page
//!     content_type: page
//!     extension: md
//!   - kind: data
//!     content_type: navigation
//!     file: data/navigation.yml
//!     format: yaml_menu
//! ```

use serde::{Deserialize, Serialize};

/// Serialization format of a backend file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Markdown body with a YAML front-matter block.
    Markdown,
    Json,
    Yaml,
    /// YAML whose page links are rewritten between content ids and site URLs.
    YamlMenu,
}

impl FileFormat {
    /// Guess a format from a file extension.
    pub fn from_path(path: &str) -> Option<FileFormat> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
        match ext.as_str() {
            "md" | "markdown" => Some(FileFormat::Markdown),
            "json" => Some(FileFormat::Json),
            "yml" | "yaml" => Some(FileFormat::Yaml),
            _ => None,
        }
    }
}

/// Mapping rule for one content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigItem {
    /// Many files under the content root; path derived from the item.
    Page {
        content_type: String,
        #[serde(default = "default_extension")]
        extension: String,
    },
    /// A singleton file at a fixed path.
    Data {
        content_type: String,
        file: String,
        #[serde(default)]
        format: Option<FileFormat>,
    },
}

impl ConfigItem {
    pub fn content_type(&self) -> &str {
        match self {
            ConfigItem::Page { content_type, .. } | ConfigItem::Data { content_type, .. } => {
                content_type
            }
        }
    }

    /// Format used when serializing items of this type. `None` when a data
    /// file has neither an explicit format nor a recognised extension.
    pub fn format(&self) -> Option<FileFormat> {
        match self {
            ConfigItem::Page { .. } => Some(FileFormat::Markdown),
            ConfigItem::Data { file, format, .. } => format.or_else(|| FileFormat::from_path(file)),
        }
    }
}

fn default_extension() -> String {
    "md".to_string()
}

fn default_content_root() -> String {
    "content".to_string()
}

/// Per-site content mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_content_root")]
    pub content_root: String,
    #[serde(default)]
    pub items: Vec<ConfigItem>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            content_root: default_content_root(),
            items: vec![ConfigItem::Page {
                content_type: "page".to_string(),
                extension: default_extension(),
            }],
        }
    }
}

impl SiteConfig {
    pub fn item_for(&self, content_type: &str) -> Option<&ConfigItem> {
        self.items.iter().find(|item| item.content_type() == content_type)
    }

    /// The data item whose fixed `file` equals `path`.
    pub fn data_item_for_path(&self, path: &str) -> Option<&ConfigItem> {
        let path = path.trim_start_matches('/');
        self.items.iter().find(|item| match item {
            ConfigItem::Data { file, .. } => file.trim_start_matches('/') == path,
            ConfigItem::Page { .. } => false,
        })
    }

    /// Page items whose extension matches `path`.
    pub fn page_items_for_path(&self, path: &str) -> Vec<&ConfigItem> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        self.items
            .iter()
            .filter(|item| match item {
                ConfigItem::Page { extension, .. } => extension.eq_ignore_ascii_case(ext),
                ConfigItem::Data { .. } => false,
            })
            .collect()
    }

    /// Content root without surrounding slashes.
    pub fn root(&self) -> &str {
        self.content_root.trim_matches('/')
    }
}
