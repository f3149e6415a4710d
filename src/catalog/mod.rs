pub mod cache;

pub use cache::CatalogCache;

use crate::error::{Error, Result};
use crate::WordId;
use include_dir::{include_dir, Dir};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

static CATALOG_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/src/catalog/data");

/// Textbook slice a learner studies from: grade, semester and edition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogScope {
    pub grade: u8,
    pub semester: u8,
    pub edition: String,
}

impl CatalogScope {
    pub fn new(grade: u8, semester: u8, edition: impl Into<String>) -> Self {
        Self {
            grade,
            semester,
            edition: edition.into(),
        }
    }
}

impl fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/g{}s{}", self.edition, self.grade, self.semester)
    }
}

/// Immutable reference entry for one dictation word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogWord {
    pub word_id: WordId,
    /// Canonical text answers are compared against
    pub text: String,
    pub pinyin: String,
    #[serde(default)]
    pub hint: Option<String>,
    /// 识字 / 写字 / 词语
    pub kind: String,
    pub unit: u32,
    #[serde(default)]
    pub lesson: Option<u32>,
}

/// One textbook as stored on disk
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogBook {
    pub scope: CatalogScope,
    pub words: Vec<CatalogWord>,
}

/// Read-only word catalog consumed by the engine.
///
/// Unknown scopes yield an empty list rather than an error so callers can
/// treat them as "nothing to practice".
pub trait Catalog: Send + Sync {
    /// All words of a scope, in catalog insertion order
    fn lookup(&self, scope: &CatalogScope) -> Vec<CatalogWord>;

    fn word(&self, word_id: WordId) -> Option<CatalogWord>;
}

/// Catalog backed by JSON textbook files
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    books: HashMap<CatalogScope, Vec<CatalogWord>>,
    index: HashMap<WordId, (CatalogScope, usize)>,
}

impl JsonCatalog {
    pub fn from_books(books: Vec<CatalogBook>) -> Result<Self> {
        let mut catalog = JsonCatalog::default();
        for book in books {
            let entry = catalog.books.entry(book.scope.clone()).or_default();
            for word in book.words {
                if catalog.index.contains_key(&word.word_id) {
                    return Err(Error::Catalog(format!(
                        "duplicate word id {} in {}",
                        word.word_id, book.scope
                    )));
                }
                catalog
                    .index
                    .insert(word.word_id, (book.scope.clone(), entry.len()));
                entry.push(word);
            }
        }
        Ok(catalog)
    }

    /// Load a JSON array of textbooks from disk
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let books: Vec<CatalogBook> = serde_json::from_slice(&bytes)?;
        Self::from_books(books)
    }

    /// The sample textbooks compiled into the binary
    pub fn bundled() -> Result<Self> {
        let mut books = Vec::new();
        for file in CATALOG_DIR.files() {
            let contents = file.contents_utf8().ok_or_else(|| {
                Error::Catalog(format!("{} is not valid UTF-8", file.path().display()))
            })?;
            books.push(serde_json::from_str::<CatalogBook>(contents)?);
        }
        Self::from_books(books)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &CatalogScope> {
        self.books.keys()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Catalog for JsonCatalog {
    fn lookup(&self, scope: &CatalogScope) -> Vec<CatalogWord> {
        self.books.get(scope).cloned().unwrap_or_default()
    }

    fn word(&self, word_id: WordId) -> Option<CatalogWord> {
        let (scope, idx) = self.index.get(&word_id)?;
        self.books.get(scope).and_then(|words| words.get(*idx)).cloned()
    }
}
