//! Card catalog as seen by the art sweep: which (id, variant) pairs exist,
//! which the user owns, and which revision each entry is at.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Art variant of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Normal,
    Golden,
    Diamond,
    Signature,
}

impl Variant {
    pub const ALL: [Variant; 4] = [
        Variant::Normal,
        Variant::Golden,
        Variant::Diamond,
        Variant::Signature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Golden => "golden",
            Self::Diamond => "diamond",
            Self::Signature => "signature",
        }
    }

    /// Every variant except the plain one.
    pub fn is_premium(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "golden" => Ok(Self::Golden),
            "diamond" => Ok(Self::Diamond),
            "signature" => Ok(Self::Signature),
            other => Err(format!("unknown variant: {other}")),
        }
    }
}

/// Identity of one art asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub id: String,
    pub variant: Variant,
}

impl AssetKey {
    pub fn new(id: impl Into<String>, variant: Variant) -> Self {
        Self {
            id: id.into(),
            variant,
        }
    }

    /// Cache key, `{id}_{variant}`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.id, self.variant)
    }

    /// Render the art host URL from a template containing `{id}` and
    /// `{variant}` placeholders.
    pub fn url(&self, template: &str) -> String {
        template
            .replace("{id}", &self.id)
            .replace("{variant}", self.variant.as_str())
    }
}

/// One card in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCard {
    pub id: String,
    /// Upstream revision marker; a change invalidates miss sentinels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Variants the art host may serve for this card.
    #[serde(default = "default_variants")]
    pub variants: Vec<Variant>,
    /// Variants present in the user's collection.
    #[serde(default)]
    pub owned: Vec<Variant>,
}

fn default_variants() -> Vec<Variant> {
    vec![Variant::Normal, Variant::Golden]
}

/// The full catalog a sweep runs over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub cards: Vec<CatalogCard>,
}

/// Which slice of the catalog a sweep phase covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSelector {
    /// Premium variants the user owns.
    OwnedPremium,
    /// Normal variants the user owns.
    OwnedNormal,
    /// Every variant the catalog lists, owned or not.
    All,
}

impl PhaseSelector {
    fn matches(self, card: &CatalogCard, variant: Variant) -> bool {
        match self {
            Self::OwnedPremium => variant.is_premium() && card.owned.contains(&variant),
            Self::OwnedNormal => variant == Variant::Normal && card.owned.contains(&variant),
            Self::All => true,
        }
    }
}

impl Catalog {
    pub fn new(cards: Vec<CatalogCard>) -> Self {
        Self { cards }
    }

    /// Every (id, variant) pair the catalog lists, deduplicated and sorted.
    pub fn keys(&self) -> Vec<AssetKey> {
        self.select(PhaseSelector::All)
    }

    /// Pairs matched by `selector`, deduplicated and sorted.
    pub fn select(&self, selector: PhaseSelector) -> Vec<AssetKey> {
        let mut out = BTreeSet::new();
        for card in &self.cards {
            for &variant in &card.variants {
                if selector.matches(card, variant) {
                    out.insert(AssetKey::new(card.id.clone(), variant));
                }
            }
        }
        out.into_iter().collect()
    }

    /// Keys whose upstream entry changed between `old` and `self`: a
    /// different revision, or a card/variant that did not exist before.
    pub fn changed_since(&self, old: &Catalog) -> Vec<AssetKey> {
        let previous: HashMap<&str, &CatalogCard> =
            old.cards.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut out = BTreeSet::new();
        for card in &self.cards {
            match previous.get(card.id.as_str()) {
                Some(prev) if prev.revision == card.revision => {
                    for &variant in &card.variants {
                        if !prev.variants.contains(&variant) {
                            out.insert(AssetKey::new(card.id.clone(), variant));
                        }
                    }
                }
                _ => {
                    for &variant in &card.variants {
                        out.insert(AssetKey::new(card.id.clone(), variant));
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
