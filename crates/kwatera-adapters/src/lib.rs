//! Listing extraction and the source adapter that drives it.
//!
//! Extraction is coupled to one site's presentational markup. Both extractors here read
//! the same markers from [`ExtractionPatterns`]; when the site changes its markup the
//! result is an empty batch, not an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use html_escape::decode_html_entities;
use kwatera_core::ListingDraft;
use kwatera_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwatera-adapters";

pub const OTODOM_SOURCE_ID: &str = "otodom-poznan";
pub const OTODOM_BASE_URL: &str = "https://www.otodom.pl";
pub const OTODOM_POZNAN_LISTING_URLS: [&str; 2] = [
    "https://www.otodom.pl/pl/wyniki/wynajem/mieszkanie/wielkopolskie/poznan/poznan/poznan?ownerTypeSingleSelect=ALL&areaMin=45&by=LATEST&direction=DESC&limit=72",
    "https://www.otodom.pl/pl/wyniki/wynajem/mieszkanie/wielkopolskie/poznan/poznan/poznan?ownerTypeSingleSelect=ALL&areaMin=45&by=LATEST&direction=DESC&limit=72&page=2",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AdapterError {
    fn pattern(pattern: impl Into<String>, message: impl ToString) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }
}

/// Markers identifying one listing card and its fields in the results markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPatterns {
    pub container_tag: String,
    pub link_data_cy: String,
    pub title_data_cy: String,
    pub price_class: String,
    pub secondary_cost_class: String,
}

impl Default for ExtractionPatterns {
    fn default() -> Self {
        Self {
            container_tag: "article".into(),
            link_data_cy: "listing-item-link".into(),
            title_data_cy: "listing-item-title".into(),
            price_class: "css-1grq1gi e1uoo6be1".into(),
            secondary_cost_class: "css-13du2ho e1uoo6be2".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    #[default]
    Pattern,
    Selector,
}

/// Turns one results page into listing candidates in document order.
pub trait ListingExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, page: &FetchedPage) -> Vec<ListingDraft>;
}

pub fn build_extractor(
    strategy: ExtractionStrategy,
    base_url: &str,
    patterns: &ExtractionPatterns,
) -> Result<Box<dyn ListingExtractor>, AdapterError> {
    Ok(match strategy {
        ExtractionStrategy::Pattern => Box::new(PatternExtractor::new(base_url, patterns)?),
        ExtractionStrategy::Selector => Box::new(SelectorExtractor::new(base_url, patterns)?),
    })
}

/// Floor and area heuristics shared by every extractor.
#[derive(Debug, Clone)]
pub struct FieldDerivation {
    floor_number: Regex,
    price_per_area: Regex,
}

impl FieldDerivation {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            floor_number: compile(r"(?i)(\d+)\s*piętro")?,
            price_per_area: compile(r"(\d+)\s*zł/m²")?,
        })
    }

    /// `parter` wins over a numbered floor; a bare `piętro` mention yields `piętro`.
    pub fn floor(&self, title: &str) -> Option<String> {
        let lower = title.to_lowercase();
        if lower.contains("parter") {
            return Some("parter".into());
        }
        if !lower.contains("piętro") {
            return None;
        }
        Some(match self.floor_number.captures(title) {
            Some(caps) => format!("{} piętro", &caps[1]),
            None => "piętro".into(),
        })
    }

    /// Reads the number in front of a `zł/m²` figure and reports it as the area.
    pub fn area(&self, secondary_cost: &str) -> Option<String> {
        self.price_per_area
            .captures(secondary_cost)
            .map(|caps| format!("{} m²", &caps[1]))
    }
}

pub fn combine_price(primary: &str, secondary: Option<&str>) -> String {
    match secondary {
        Some(extra) if !extra.is_empty() => format!("{primary} ({extra})"),
        _ => primary.to_string(),
    }
}

pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(String::from)
}

/// Field values pulled out of one listing card before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFragment {
    pub href: Option<String>,
    pub title: Option<String>,
    pub primary_price: Option<String>,
    pub secondary_cost: Option<String>,
    pub image: Option<String>,
}

impl RawFragment {
    /// `None` when the card has no usable link, title or price.
    pub fn into_draft(self, base: &Url, derive: &FieldDerivation) -> Option<ListingDraft> {
        let link = resolve_link(base, self.href.as_deref()?)?;
        let title = self.title.map(|t| t.trim().to_string()).unwrap_or_default();
        let primary = self
            .primary_price
            .map(|p| p.trim().to_string())
            .unwrap_or_default();
        let secondary = self
            .secondary_cost
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let price = combine_price(&primary, secondary.as_deref());
        if title.is_empty() || price.is_empty() {
            return None;
        }

        Some(ListingDraft {
            external_id: link.clone(),
            floor: derive.floor(&title),
            area: secondary.as_deref().and_then(|s| derive.area(s)),
            image_url: self.image.filter(|i| !i.trim().is_empty()),
            title,
            price,
            external_link: link,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, AdapterError> {
    Regex::new(pattern).map_err(|e| AdapterError::pattern(pattern, e))
}

/// Captured markup still carries entity references; decode them so both extractors
/// agree on links and text.
fn first_capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| decode_html_entities(m.as_str()).into_owned())
}

/// Regex extraction over the raw markup, no DOM.
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    base: Url,
    derive: FieldDerivation,
    container: Regex,
    link: Regex,
    title: Regex,
    price: Regex,
    secondary_cost: Regex,
    image: Regex,
}

impl PatternExtractor {
    pub fn new(base_url: &str, patterns: &ExtractionPatterns) -> Result<Self, AdapterError> {
        let tag = regex::escape(&patterns.container_tag);
        let text_after = |attr: &str, value: &str| {
            format!(r#"{attr}="{}"[^>]*>([^<]*)<"#, regex::escape(value))
        };
        Ok(Self {
            base: Url::parse(base_url)?,
            derive: FieldDerivation::new()?,
            container: compile(&format!(r"(?s)<{tag}[^>]*>(.*?)</{tag}>"))?,
            link: compile(&format!(
                r#"data-cy="{}"[^>]*href="([^"]*)"[^>]*>"#,
                regex::escape(&patterns.link_data_cy)
            ))?,
            title: compile(&text_after("data-cy", &patterns.title_data_cy))?,
            price: compile(&text_after("class", &patterns.price_class))?,
            secondary_cost: compile(&text_after("class", &patterns.secondary_cost_class))?,
            image: compile(r#"<img[^>]*src="([^"]*)"[^>]*>"#)?,
        })
    }

    pub fn fragment(&self, card: &str) -> RawFragment {
        RawFragment {
            href: first_capture(&self.link, card),
            title: first_capture(&self.title, card),
            primary_price: first_capture(&self.price, card),
            secondary_cost: first_capture(&self.secondary_cost, card),
            image: first_capture(&self.image, card),
        }
    }
}

impl ListingExtractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn extract(&self, page: &FetchedPage) -> Vec<ListingDraft> {
        let mut drafts = Vec::new();
        for (index, caps) in self.container.captures_iter(&page.body).enumerate() {
            let card = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            match self.fragment(card).into_draft(&self.base, &self.derive) {
                Some(draft) => drafts.push(draft),
                None => debug!(
                    url = %page.url,
                    index,
                    "skipping listing card without link, title or price"
                ),
            }
        }
        drafts
    }
}

/// CSS selector extraction over a parsed DOM.
#[derive(Debug, Clone)]
pub struct SelectorExtractor {
    base: Url,
    derive: FieldDerivation,
    container: Selector,
    link: Selector,
    title: Selector,
    price: Selector,
    secondary_cost: Selector,
    image: Selector,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::pattern(selector, e))
}

fn css_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
}

fn first_attr(card: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(ToString::to_string)
}

impl SelectorExtractor {
    pub fn new(base_url: &str, patterns: &ExtractionPatterns) -> Result<Self, AdapterError> {
        Ok(Self {
            base: Url::parse(base_url)?,
            derive: FieldDerivation::new()?,
            container: parse_selector(&patterns.container_tag)?,
            link: parse_selector(&format!(
                r#"[data-cy="{}"][href]"#,
                css_string(&patterns.link_data_cy)
            ))?,
            title: parse_selector(&format!(
                r#"[data-cy="{}"]"#,
                css_string(&patterns.title_data_cy)
            ))?,
            price: parse_selector(&format!(r#"[class="{}"]"#, css_string(&patterns.price_class)))?,
            secondary_cost: parse_selector(&format!(
                r#"[class="{}"]"#,
                css_string(&patterns.secondary_cost_class)
            ))?,
            image: parse_selector("img[src]")?,
        })
    }
}

impl ListingExtractor for SelectorExtractor {
    fn name(&self) -> &'static str {
        "selector"
    }

    fn extract(&self, page: &FetchedPage) -> Vec<ListingDraft> {
        let document = Html::parse_document(&page.body);
        let mut drafts = Vec::new();
        for (index, card) in document.select(&self.container).enumerate() {
            let fragment = RawFragment {
                href: first_attr(&card, &self.link, "href"),
                title: first_text(&card, &self.title),
                primary_price: first_text(&card, &self.price),
                secondary_cost: first_text(&card, &self.secondary_cost),
                image: first_attr(&card, &self.image, "src"),
            };
            match fragment.into_draft(&self.base, &self.derive) {
                Some(draft) => drafts.push(draft),
                None => debug!(
                    url = %page.url,
                    index,
                    "skipping listing card without link, title or price"
                ),
            }
        }
        drafts
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn listing_targets(&self) -> Vec<ListingTarget>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Vec<ListingDraft>;
}

/// Adapter for a site whose search results are server-rendered listing cards.
pub struct MarkupSourceAdapter {
    source_id: String,
    listing_urls: Vec<String>,
    extractor: Box<dyn ListingExtractor>,
}

impl MarkupSourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        listing_urls: Vec<String>,
        extractor: Box<dyn ListingExtractor>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            listing_urls,
            extractor,
        }
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }
}

#[async_trait]
impl SourceAdapter for MarkupSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        self.listing_urls
            .iter()
            .map(|url| ListingTarget { url: url.clone() })
            .collect()
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        let response = http.fetch_page(ctx.run_id, &target.url).await?;
        Ok(FetchedPage {
            source_id: self.source_id.clone(),
            url: response.final_url.clone(),
            body: response.text(),
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Vec<ListingDraft> {
        self.extractor.extract(page)
    }
}

/// The built-in source: Poznań rentals of at least 45 m², newest first, two result pages.
pub fn otodom_poznan_adapter(
    strategy: ExtractionStrategy,
) -> Result<MarkupSourceAdapter, AdapterError> {
    Ok(MarkupSourceAdapter::new(
        OTODOM_SOURCE_ID,
        OTODOM_POZNAN_LISTING_URLS.iter().map(|u| u.to_string()).collect(),
        build_extractor(strategy, OTODOM_BASE_URL, &ExtractionPatterns::default())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(body: &str) -> FetchedPage {
        FetchedPage {
            source_id: OTODOM_SOURCE_ID.into(),
            url: "https://www.otodom.pl/test".into(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }

    fn pattern_extractor() -> PatternExtractor {
        PatternExtractor::new(OTODOM_BASE_URL, &ExtractionPatterns::default()).unwrap()
    }

    #[test]
    fn ground_floor_title_and_price_per_area() {
        let html = r#"<article>
            <a data-cy="listing-item-link" href="/pl/oferta/x-ID1">
              <p data-cy="listing-item-title">Mieszkanie, parter, 50m²</p></a>
            <span class="css-1grq1gi e1uoo6be1">2 000 zł</span>
            <span class="css-13du2ho e1uoo6be2">25 zł/m²</span>
        </article>"#;
        let drafts = pattern_extractor().extract(&page_with(html));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].floor.as_deref(), Some("parter"));
        assert_eq!(drafts[0].area.as_deref(), Some("25 m²"));
        assert_eq!(drafts[0].price, "2 000 zł (25 zł/m²)");
        assert_eq!(drafts[0].external_id, "https://www.otodom.pl/pl/oferta/x-ID1");
        assert_eq!(drafts[0].external_id, drafts[0].external_link);
    }

    #[test]
    fn floor_heuristics() {
        let derive = FieldDerivation::new().unwrap();
        assert_eq!(derive.floor("Kawalerka, PARTER").as_deref(), Some("parter"));
        assert_eq!(derive.floor("2 pokoje, 3 piętro").as_deref(), Some("3 piętro"));
        assert_eq!(derive.floor("4 PIĘTRO z windą").as_deref(), Some("4 piętro"));
        assert_eq!(derive.floor("Ostatnie piętro").as_deref(), Some("piętro"));
        assert_eq!(derive.floor("Dom z ogrodem"), None);
        assert_eq!(derive.area("Czynsz: 500 zł"), None);
        assert_eq!(derive.area("48 zł/m²").as_deref(), Some("48 m²"));
    }

    #[test]
    fn cards_without_link_or_price_are_skipped() {
        let html = r#"
            <article><p data-cy="listing-item-title">No link</p>
              <span class="css-1grq1gi e1uoo6be1">1 zł</span></article>
            <article><a data-cy="listing-item-link" href="/a">
              <p data-cy="listing-item-title">No price</p></a></article>
            <article><a data-cy="listing-item-link" href="/b"></a>
              <span class="css-1grq1gi e1uoo6be1">9 zł</span></article>
        "#;
        assert!(pattern_extractor().extract(&page_with(html)).is_empty());
    }

    #[test]
    fn unrelated_markup_yields_nothing() {
        let page =
            page_with(r#"<html><body><div class="new-layout">Mieszkania</div></body></html>"#);
        assert!(pattern_extractor().extract(&page).is_empty());
        let selector =
            SelectorExtractor::new(OTODOM_BASE_URL, &ExtractionPatterns::default()).unwrap();
        assert!(selector.extract(&page).is_empty());
    }

    #[test]
    fn combine_price_appends_secondary_in_parentheses() {
        assert_eq!(
            combine_price("3 000 zł", Some("+ czynsz 400 zł")),
            "3 000 zł (+ czynsz 400 zł)"
        );
        assert_eq!(combine_price("3 000 zł", Some("")), "3 000 zł");
        assert_eq!(combine_price("3 000 zł", None), "3 000 zł");
    }

    #[test]
    fn relative_and_absolute_links_resolve_against_base() {
        let base = Url::parse(OTODOM_BASE_URL).unwrap();
        assert_eq!(
            resolve_link(&base, "/pl/oferta/a-ID1").as_deref(),
            Some("https://www.otodom.pl/pl/oferta/a-ID1")
        );
        assert_eq!(
            resolve_link(&base, "https://example.com/x").as_deref(),
            Some("https://example.com/x")
        );
    }

    #[test]
    fn default_adapter_targets_both_result_pages() {
        let adapter = otodom_poznan_adapter(ExtractionStrategy::default()).unwrap();
        assert_eq!(adapter.source_id(), OTODOM_SOURCE_ID);
        assert_eq!(adapter.extractor_name(), "pattern");
        let targets = adapter.listing_targets();
        assert_eq!(targets.len(), 2);
        assert!(targets[1].url.ends_with("&page=2"));
    }
}
