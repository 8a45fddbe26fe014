//! Listing-source contracts + the public-HTML source implementation.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use propwatch_core::RawListing;
use propwatch_storage::{FetchError, PageFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

pub const CRATE_NAME: &str = "propwatch-adapters";

/// A site that can be scraped for listings. Fetching and parsing live
/// behind this seam so the monitor never knows which site it is watching.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;
    /// Base URL used to absolutize relative listing links.
    fn base_url(&self) -> &str;
    /// One fetch cycle: pull the listings page(s) and return raw records.
    async fn fetch(&self, fetcher: &PageFetcher) -> Result<Vec<RawListing>, FetchError>;
}

/// On-disk registry of watch targets (`sources.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub enabled: bool,
    pub base_url: String,
    pub listing_url: String,
    #[serde(default)]
    pub selectors: SelectorSet,
}

/// CSS selectors describing one site's listing markup. Defaults match the
/// property-bazaar card layout this project started from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    pub card: String,
    /// Attribute on the card element carrying the stable listing id.
    pub id_attr: String,
    pub title: String,
    pub price: String,
    pub location: String,
    pub posted: String,
    pub amenities: String,
    pub link: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            card: "[data-hz-id]".to_string(),
            id_attr: "data-hz-id".to_string(),
            title: "h2.item-title a".to_string(),
            price: "span.price".to_string(),
            location: "address.item-address".to_string(),
            posted: "div.item-date".to_string(),
            amenities: "ul.item-amenities li".to_string(),
            link: "h2.item-title a".to_string(),
        }
    }
}

#[derive(Debug)]
struct CompiledSelectors {
    card: Selector,
    id_attr: String,
    title: Selector,
    price: Selector,
    location: Selector,
    posted: Selector,
    amenities: Selector,
    link: Selector,
}

impl CompiledSelectors {
    fn compile(set: &SelectorSet) -> Result<Self> {
        let parse = |s: &str| {
            Selector::parse(s).map_err(|e| anyhow!("invalid selector `{s}`: {e}"))
        };
        Ok(Self {
            card: parse(&set.card)?,
            id_attr: set.id_attr.clone(),
            title: parse(&set.title)?,
            price: parse(&set.price)?,
            location: parse(&set.location)?,
            posted: parse(&set.posted)?,
            amenities: parse(&set.amenities)?,
            link: parse(&set.link)?,
        })
    }
}

/// [`ListingSource`] for sites exposing a plain HTML listings page.
pub struct HtmlListingSource {
    source_id: String,
    base_url: String,
    listing_url: String,
    selectors: CompiledSelectors,
}

impl HtmlListingSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            source_id: config.source_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            listing_url: config.listing_url.clone(),
            selectors: CompiledSelectors::compile(&config.selectors)
                .with_context(|| format!("compiling selectors for {}", config.source_id))?,
        })
    }

    fn parse_page(&self, html: &str) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        document
            .select(&self.selectors.card)
            .map(|card| self.parse_card(card))
            .collect()
    }

    fn parse_card(&self, card: ElementRef<'_>) -> RawListing {
        let amenities: Vec<String> = card
            .select(&self.selectors.amenities)
            .filter_map(|n| text_of(n))
            .collect();
        RawListing {
            id: card
                .value()
                .attr(&self.selectors.id_attr)
                .map(|s| s.to_string()),
            title: first_text(card, &self.selectors.title),
            price: first_text(card, &self.selectors.price),
            location: first_text(card, &self.selectors.location),
            bedrooms: amenity_matching(&amenities, "bed"),
            bathrooms: amenity_matching(&amenities, "bath"),
            property_type: amenities
                .iter()
                .find(|a| {
                    let lower = a.to_ascii_lowercase();
                    ["flat", "apartment", "house", "room", "commercial"]
                        .iter()
                        .any(|kw| lower.contains(kw))
                })
                .cloned(),
            posted_text: first_text(card, &self.selectors.posted),
            url: first_attr(card, &self.selectors.link, "href"),
        }
    }
}

#[async_trait]
impl ListingSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, fetcher: &PageFetcher) -> Result<Vec<RawListing>, FetchError> {
        let html = fetcher.fetch_text(&self.listing_url).await?;
        Ok(self.parse_page(&html))
    }
}

/// Build every enabled source from a registry.
pub fn sources_from_registry(registry: &SourceRegistry) -> Result<Vec<Box<dyn ListingSource>>> {
    registry
        .enabled_sources()
        .map(|config| {
            HtmlListingSource::from_config(config).map(|s| Box::new(s) as Box<dyn ListingSource>)
        })
        .collect()
}

fn text_of(node: ElementRef<'_>) -> Option<String> {
    let text = node.text().collect::<String>();
    let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().and_then(text_of)
}

fn first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn amenity_matching(amenities: &[String], keyword: &str) -> Option<String> {
    amenities
        .iter()
        .find(|a| a.to_ascii_lowercase().contains(keyword))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use propwatch_core::normalize;

    const SAMPLE_PAGE: &str = r#"
<html><body>
  <div class="item-listing-wrap" data-hz-id="hz-1029">
    <h2 class="item-title"><a href="/property/hz-1029">2BHK Flat in Baneshwor</a></h2>
    <span class="price">Rs 9,500</span>
    <address class="item-address">Baneshwor, Kathmandu</address>
    <div class="item-date">40 minutes ago</div>
    <ul class="item-amenities">
      <li>Beds: 2</li>
      <li>Bath: 1</li>
      <li>Flat / Apartment</li>
    </ul>
  </div>
  <div class="item-listing-wrap" data-hz-id="hz-2044">
    <h2 class="item-title"><a href="/property/hz-2044">Single Room near Patan</a></h2>
    <span class="price">Rs6,000</span>
    <address class="item-address">Patan, Lalitpur</address>
    <div class="item-date">2 hours ago</div>
    <ul class="item-amenities"><li>Room</li></ul>
  </div>
  <div class="item-listing-wrap" data-hz-id="hz-3001">
    <h2 class="item-title"><a href="/property/hz-3001">House without price</a></h2>
    <address class="item-address">Bhaktapur</address>
  </div>
</body></html>
"#;

    fn bazaar_source() -> HtmlListingSource {
        HtmlListingSource::from_config(&SourceConfig {
            source_id: "nepal-bazaar".to_string(),
            enabled: true,
            base_url: "https://nepalpropertybazaar.com".to_string(),
            listing_url: "https://nepalpropertybazaar.com/rent".to_string(),
            selectors: SelectorSet::default(),
        })
        .expect("source")
    }

    #[test]
    fn parses_listing_cards() {
        let source = bazaar_source();
        let raws = source.parse_page(SAMPLE_PAGE);
        assert_eq!(raws.len(), 3);

        assert_eq!(raws[0].id.as_deref(), Some("hz-1029"));
        assert_eq!(raws[0].price.as_deref(), Some("Rs 9,500"));
        assert_eq!(raws[0].bedrooms.as_deref(), Some("Beds: 2"));
        assert_eq!(raws[0].posted_text.as_deref(), Some("40 minutes ago"));
        assert_eq!(raws[0].url.as_deref(), Some("/property/hz-1029"));

        assert_eq!(raws[1].property_type.as_deref(), Some("Room"));
        assert_eq!(raws[2].price, None);
    }

    #[test]
    fn parsed_cards_survive_normalization_except_malformed() {
        let source = bazaar_source();
        let raws = source.parse_page(SAMPLE_PAGE);
        let listings: Vec<_> = raws
            .into_iter()
            .filter_map(|raw| normalize(raw, source.base_url()).ok())
            .collect();
        // hz-3001 has no price and is dropped.
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, "hz-1029");
        assert_eq!(
            listings[1].url,
            "https://nepalpropertybazaar.com/property/hz-2044"
        );
        assert_eq!(listings[1].posted_minutes_ago, Some(120));
    }

    #[test]
    fn registry_filters_disabled_sources() {
        let yaml = r#"
sources:
  - source_id: nepal-bazaar
    enabled: true
    base_url: https://nepalpropertybazaar.com
    listing_url: https://nepalpropertybazaar.com/rent
  - source_id: other-site
    enabled: false
    base_url: https://example.com
    listing_url: https://example.com/listings
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("yaml");
        let sources = sources_from_registry(&registry).expect("sources");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_id(), "nepal-bazaar");
    }

    #[test]
    fn bad_selector_is_rejected_at_construction() {
        let mut config = SourceConfig {
            source_id: "broken".to_string(),
            enabled: true,
            base_url: "https://example.com".to_string(),
            listing_url: "https://example.com/x".to_string(),
            selectors: SelectorSet::default(),
        };
        config.selectors.card = ":::not-a-selector".to_string();
        assert!(HtmlListingSource::from_config(&config).is_err());
    }
}
