use chrono::DateTime;
use std::ops::Deref;
use std::sync::Arc;

/// Display format for [`FeedItem::formatted_date`], e.g. "October 21, 2015".
const DISPLAY_DATE_FORMAT: &str = "%B %d, %Y";

/// One post decoded from the feed.
///
/// Built by the parser and never modified afterwards. Any field the feed did
/// not provide is an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedItem {
    title: String,
    description: String,
    image_url: String,
    link: String,
    published_at: String,
}

impl FeedItem {
    pub(crate) fn new(
        title: String,
        description: String,
        image_url: String,
        link: String,
        published_at: String,
    ) -> Self {
        Self {
            title,
            description,
            image_url,
            link,
            published_at,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Post summary. May contain HTML markup.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Thumbnail URL from the item's `media:content` element.
    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    /// Raw `pubDate` text, e.g. "Wed, 21 Oct 2015 07:28:00 GMT".
    pub fn published_at(&self) -> &str {
        &self.published_at
    }

    /// Reformats the publish date as "Month dd, yyyy".
    ///
    /// The date is rendered in the offset it was published with. The weekday
    /// name is ignored, so a feed that gets it wrong still formats. Anything
    /// that is not an RFC 2822 date is returned unchanged.
    pub fn formatted_date(&self) -> String {
        match DateTime::parse_from_rfc2822(without_weekday(self.published_at.trim())) {
            Ok(date) => date.format(DISPLAY_DATE_FORMAT).to_string(),
            Err(e) => {
                tracing::trace!(
                    raw = %self.published_at,
                    error = %e,
                    "Unparsable pubDate, showing raw value"
                );
                self.published_at.clone()
            }
        }
    }
}

/// Drops a leading "Www," token.
fn without_weekday(raw: &str) -> &str {
    match raw.split_once(',') {
        Some((day, rest)) if !day.is_empty() && day.chars().all(|c| c.is_ascii_alphabetic()) => {
            rest.trim_start()
        }
        _ => raw,
    }
}

/// Ordered, shared list of posts as stored in the cache.
///
/// Cloning only bumps a reference count, so every caller served from the
/// cache sees the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItems(Arc<[FeedItem]>);

impl FeedItems {
    /// The first post, which the display layer shows as the featured entry.
    pub fn featured(&self) -> Option<&FeedItem> {
        self.0.first()
    }

    /// Everything after the featured entry.
    pub fn others(&self) -> &[FeedItem] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Whether both handles point at the same cached list.
    pub fn ptr_eq(&self, other: &FeedItems) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for FeedItems {
    type Target = [FeedItem];

    fn deref(&self) -> &[FeedItem] {
        &self.0
    }
}

impl From<Vec<FeedItem>> for FeedItems {
    fn from(items: Vec<FeedItem>) -> Self {
        Self(items.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item_with_date(date: &str) -> FeedItem {
        FeedItem::new(
            "Title".into(),
            String::new(),
            String::new(),
            String::new(),
            date.into(),
        )
    }

    #[test]
    fn test_formatted_date_gmt() {
        let item = item_with_date("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(item.formatted_date(), "October 21, 2015");
    }

    #[test]
    fn test_formatted_date_numeric_offset() {
        let item = item_with_date("Mon, 02 Jan 2023 23:30:00 +0000");
        assert_eq!(item.formatted_date(), "January 02, 2023");
    }

    #[test]
    fn test_formatted_date_keeps_publisher_offset() {
        // 23:30 in -0800 is already the next day in UTC
        let item = item_with_date("Tue, 31 Dec 2019 23:30:00 -0800");
        assert_eq!(item.formatted_date(), "December 31, 2019");
    }

    #[test]
    fn test_formatted_date_ignores_wrong_weekday() {
        // 21 Oct 2015 was a Wednesday
        let item = item_with_date("Thu, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(item.formatted_date(), "October 21, 2015");
    }

    #[test]
    fn test_formatted_date_without_weekday() {
        let item = item_with_date("21 Oct 2015 07:28:00 GMT");
        assert_eq!(item.formatted_date(), "October 21, 2015");
    }

    #[test]
    fn test_formatted_date_unparsable_returns_raw() {
        let item = item_with_date("sometime last week");
        assert_eq!(item.formatted_date(), "sometime last week");
    }

    #[test]
    fn test_formatted_date_empty_returns_empty() {
        assert_eq!(item_with_date("").formatted_date(), "");
    }

    #[test]
    fn test_featured_and_others() {
        let items: FeedItems = vec![
            item_with_date("a"),
            item_with_date("b"),
            item_with_date("c"),
        ]
        .into();
        assert_eq!(items.featured().map(|i| i.published_at()), Some("a"));
        assert_eq!(items.others().len(), 2);
        assert_eq!(items.others()[0].published_at(), "b");
    }

    #[test]
    fn test_featured_on_empty_list() {
        let items: FeedItems = Vec::new().into();
        assert!(items.featured().is_none());
        assert!(items.others().is_empty());
    }

    #[test]
    fn test_clone_shares_allocation() {
        let items: FeedItems = vec![item_with_date("a")].into();
        let copy = items.clone();
        assert!(items.ptr_eq(&copy));
    }

    proptest! {
        #[test]
        fn formatted_date_never_panics(raw in ".*") {
            let item = item_with_date(&raw);
            let _ = item.formatted_date();
        }

        #[test]
        fn formatted_date_returns_raw_for_plain_words(raw in "[a-z ]{0,30}") {
            let item = item_with_date(&raw);
            prop_assert_eq!(item.formatted_date(), raw);
        }
    }
}
