//! Bid list page → normalized `BidRecord`s.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use kapt_core::{BidRecord, BidTimestamp, Category, Region};
use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

/// Rows per page on the bid board. A full page is the only hint that another follows.
pub const PAGE_SIZE: usize = 10;

const MIN_COLUMNS: usize = 7;
const SEQUENCE_HEADER: &str = "순번";
const TITLE_HEADER: &str = "공고명";
const NO_RESULT_PHRASES: [&str; 3] = ["데이터가 없습니다", "검색된", "없습니다"];

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooFewColumns(usize),
    MissingId,
    HeaderRow,
    NonNumericId(String),
    MissingTitle,
    MissingAptName,
    NoResults,
}

/// A table row that was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub row: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub records: Vec<BidRecord>,
    pub has_next: bool,
    pub warnings: Vec<ParseWarning>,
}

/// Where relative detail links point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkBase {
    pub origin: String,
    pub relative_base: String,
}

impl Default for LinkBase {
    fn default() -> Self {
        Self {
            origin: "https://www.k-apt.go.kr".to_string(),
            relative_base: "https://www.k-apt.go.kr/bid/".to_string(),
        }
    }
}

impl LinkBase {
    pub fn absolutize(&self, href: &str) -> String {
        let href = href.trim();
        if href.is_empty() {
            String::new()
        } else if href.starts_with('/') {
            format!("{}{}", self.origin.trim_end_matches('/'), href)
        } else if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", self.relative_base, href)
        }
    }
}

#[derive(Debug)]
pub struct RowParser {
    links: LinkBase,
    page_size: usize,
    table: Selector,
    row: Selector,
    anchor: Selector,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css}: {e}")))
}

impl RowParser {
    pub fn new(links: LinkBase, page_size: usize) -> Result<Self, AdapterError> {
        Ok(Self {
            links,
            page_size,
            table: selector("table")?,
            row: selector("tr")?,
            anchor: selector("a[href]")?,
        })
    }

    pub fn parse(&self, html: &str, scraped_at: DateTime<Utc>) -> ParsedPage {
        let document = Html::parse_document(html);
        let Some(table) = self.notice_table(&document) else {
            return ParsedPage::default();
        };

        let mut page = ParsedPage::default();
        for (index, row) in table.select(&self.row).enumerate().skip(1) {
            match self.parse_row(row, scraped_at) {
                Ok(record) => page.records.push(record),
                Err(reason) => page.warnings.push(ParseWarning { row: index, reason }),
            }
        }
        page.has_next = page.records.len() == self.page_size;
        page
    }

    /// The innermost table mentioning both the sequence and title headers.
    fn notice_table<'a>(&self, document: &'a Html) -> Option<ElementRef<'a>> {
        let candidates: Vec<ElementRef<'a>> = document
            .select(&self.table)
            .filter(|t| {
                let text = t.text().collect::<String>();
                text.contains(SEQUENCE_HEADER) && text.contains(TITLE_HEADER)
            })
            .collect();

        candidates.iter().copied().find(|outer| {
            !candidates.iter().any(|inner| {
                inner.id() != outer.id() && inner.ancestors().any(|a| a.id() == outer.id())
            })
        })
    }

    fn parse_row(&self, row: ElementRef<'_>, scraped_at: DateTime<Utc>) -> Result<BidRecord, SkipReason> {
        let cells: Vec<ElementRef<'_>> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| c.value().name() == "td")
            .collect();
        if cells.len() < MIN_COLUMNS {
            return Err(SkipReason::TooFewColumns(cells.len()));
        }

        let text = |i: usize| {
            cells
                .get(i)
                .map(|c| clean_text(&c.text().collect::<String>()))
                .unwrap_or_default()
        };

        let id = text(0);
        let title = text(3);
        let apt_name = text(6);
        if id.is_empty() {
            return Err(SkipReason::MissingId);
        }
        if title.is_empty() {
            return Err(SkipReason::MissingTitle);
        }
        if apt_name.is_empty() {
            return Err(SkipReason::MissingAptName);
        }
        if NO_RESULT_PHRASES.iter().any(|p| title.contains(p)) {
            return Err(SkipReason::NoResults);
        }
        if id == SEQUENCE_HEADER {
            return Err(SkipReason::HeaderRow);
        }
        if !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(SkipReason::NonNumericId(id));
        }

        let detail_link = cells[3]
            .select(&self.anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| self.links.absolutize(href))
            .unwrap_or_default();

        Ok(BidRecord {
            region: extract_region(&title),
            category: classify_category(&title),
            id,
            kind: text(1),
            method: text(2),
            deadline: parse_timestamp(&text(4)),
            status: text(5),
            apt_name,
            post_date: parse_timestamp(&text(7)),
            title,
            detail_link,
            scraped_at,
        })
    }
}

/// Parse with the default link base and page size.
pub fn parse_page(html: &str, scraped_at: DateTime<Utc>) -> Result<ParsedPage, AdapterError> {
    Ok(RowParser::new(LinkBase::default(), PAGE_SIZE)?.parse(html, scraped_at))
}

pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `None` for an empty cell, `Raw` when no known layout matches.
pub fn parse_timestamp(text: &str) -> Option<BidTimestamp> {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(BidTimestamp::Parsed(ts));
        }
    }
    for fmt in DATE_FORMATS {
        if let Some(ts) = NaiveDate::parse_from_str(&cleaned, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Some(BidTimestamp::Parsed(ts));
        }
    }
    Some(BidTimestamp::Raw(text.trim().to_string()))
}

/// Region from a leading `[tag]` in the title.
pub fn extract_region(title: &str) -> Region {
    let Some(tag) = title
        .strip_prefix('[')
        .and_then(|rest| rest.find(']').map(|end| &rest[..end]))
    else {
        return Region::Other;
    };

    if tag.contains("서울") {
        Region::Seoul
    } else if tag.contains("인천") {
        Region::Incheon
    } else if tag.contains("경기") {
        Region::Gyeonggi
    } else if tag.contains("강원") {
        Region::Gangwon
    } else if tag.contains("충북") || tag.contains("충청북도") {
        Region::Chungbuk
    } else if tag.contains("충남") || tag.contains("충청남도") {
        Region::Chungnam
    } else {
        Region::Other
    }
}

/// First matching keyword group wins: security, then service, then contractor.
pub fn classify_category(title: &str) -> Category {
    let lower = title.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["경비", "보안"]) {
        Category::Security
    } else if any(&["용역", "서비스", "청소", "관리", "시설", "유지보수"]) {
        Category::Service
    } else if any(&["사업자", "업체", "선정", "공사", "시공", "건설"]) {
        Category::Contractor
    } else {
        Category::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scraped_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).single().unwrap()
    }

    fn row(id: &str, title: &str, href: &str, post: &str) -> String {
        format!(
            "<tr><td>{id}</td><td>일반</td><td>적격심사제</td>\
             <td><a href=\"{href}\">{title}</a></td><td>2025-06-20 10:00</td>\
             <td>진행중</td><td>테스트아파트</td><td>{post}</td></tr>"
        )
    }

    fn table(rows: &[String]) -> String {
        format!(
            "<table><tr><th>순번</th><th>구분</th><th>방식</th><th>공고명</th>\
             <th>마감</th><th>상태</th><th>단지명</th><th>등록일</th></tr>{}</table>",
            rows.concat()
        )
    }

    fn page(rows: &[String]) -> String {
        format!("<html><body>{}</body></html>", table(rows))
    }

    #[test]
    fn region_comes_from_leading_tag_only() {
        assert_eq!(extract_region("[서울] 경비용역"), Region::Seoul);
        assert_eq!(extract_region("[충청남도 천안] 청소"), Region::Chungnam);
        assert_eq!(extract_region("[부산] 청소"), Region::Other);
        assert_eq!(extract_region("청소 [서울]"), Region::Other);
        assert_eq!(extract_region("[서울 청소"), Region::Other);
    }

    #[test]
    fn category_priority_prefers_security_over_service() {
        assert_eq!(classify_category("경비용역 업체 선정"), Category::Security);
        assert_eq!(classify_category("승강기 유지보수 업체 선정"), Category::Service);
        assert_eq!(classify_category("옥상 방수공사 사업자 선정"), Category::Contractor);
        assert_eq!(classify_category("알뜰장터 운영"), Category::Other);
    }

    #[test]
    fn links_are_made_absolute() {
        let links = LinkBase::default();
        assert_eq!(
            links.absolutize("/bid/bidDetail.do?bidNum=1"),
            "https://www.k-apt.go.kr/bid/bidDetail.do?bidNum=1"
        );
        assert_eq!(links.absolutize("https://example.org/x"), "https://example.org/x");
        assert_eq!(
            links.absolutize("bidDetail.do?bidNum=2"),
            "https://www.k-apt.go.kr/bid/bidDetail.do?bidNum=2"
        );
        assert_eq!(links.absolutize("  "), "");
    }

    #[test]
    fn timestamps_parse_or_keep_raw_text() {
        let parsed = parse_timestamp(" 2025-06-10  14:30 ").unwrap();
        assert_eq!(parsed.to_string(), "2025-06-10 14:30:00");
        assert_eq!(
            parse_timestamp("2025.06.10").unwrap().parsed().unwrap().to_string(),
            "2025-06-10 00:00:00"
        );
        assert_eq!(
            parse_timestamp("추후 공지"),
            Some(BidTimestamp::Raw("추후 공지".to_string()))
        );
        assert_eq!(parse_timestamp("   "), None);
    }

    #[test]
    fn skips_header_and_invalid_rows() {
        let html = page(&[
            row("1", "[서울] 경비용역 업체 선정", "/bid/d?1", "2025-06-01"),
            row("순번", "공고명", "", ""),
            row("", "[인천] 청소용역", "", "2025-06-01"),
            row("abc", "[경기] 청소용역", "", "2025-06-01"),
            row("5", "검색된 결과가 없습니다", "", ""),
            "<tr><td colspan=\"8\">데이터가 없습니다</td></tr>".to_string(),
        ]);
        let parsed = parse_page(&html, scraped_at()).unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert!(!parsed.has_next);
        let reasons: Vec<_> = parsed.warnings.iter().map(|w| w.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::HeaderRow,
                SkipReason::MissingId,
                SkipReason::NonNumericId("abc".into()),
                SkipReason::NoResults,
                SkipReason::TooFewColumns(1),
            ]
        );

        let record = &parsed.records[0];
        assert_eq!(record.id, "1");
        assert_eq!(record.region, Region::Seoul);
        assert_eq!(record.category, Category::Security);
        assert_eq!(record.detail_link, "https://www.k-apt.go.kr/bid/d?1");
        assert_eq!(record.status, "진행중");
        assert_eq!(record.scraped_at, scraped_at());
    }

    #[test]
    fn full_page_signals_next() {
        let rows: Vec<String> = (1..=10)
            .map(|i| row(&i.to_string(), "[서울] 청소용역", "", "2025-06-01"))
            .collect();
        let parsed = parse_page(&page(&rows), scraped_at()).unwrap();
        assert_eq!(parsed.records.len(), 10);
        assert!(parsed.has_next);
    }

    #[test]
    fn missing_post_date_column_is_tolerated() {
        let html = page(&["<tr><td>3</td><td>일반</td><td>최저가</td><td>[강원] 공사</td>\
                            <td>2025-06-20</td><td>진행중</td><td>설악아파트</td></tr>"
            .to_string()]);
        let parsed = parse_page(&html, scraped_at()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].post_date, None);
        assert_eq!(parsed.records[0].detail_link, "");
    }

    #[test]
    fn page_without_notice_table_is_empty() {
        let parsed = parse_page("<html><body><p>점검 중입니다</p></body></html>", scraped_at()).unwrap();
        assert!(parsed.records.is_empty());
        assert!(!parsed.has_next);
    }

    #[test]
    fn innermost_matching_table_is_used() {
        let inner = table(&[row("8", "[서울] 청소", "", "2025-06-02")]);
        let html = format!(
            "<html><body><table><tr><td>순번 공고명 layout</td></tr><tr><td>{inner}</td></tr></table></body></html>"
        );
        let parsed = parse_page(&html, scraped_at()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].id, "8");
    }
}
