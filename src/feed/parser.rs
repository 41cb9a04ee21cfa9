//! Streaming RSS parser.
//!
//! Walks the quick-xml event stream once, keeping only the fields of the
//! item currently being read. Elements the parser does not care about are
//! consumed with a depth counter so a nested element sharing the outer
//! element's name cannot end the skip early.

use quick_xml::events::{BytesCData, BytesStart, BytesText, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use std::io::BufRead;

use super::item::{FeedItem, FeedItems};
use crate::error::FeedError;

const RSS: &[u8] = b"rss";
const CHANNEL: &[u8] = b"channel";
const ITEM: &[u8] = b"item";
const MEDIA_CONTENT: &[u8] = b"media:content";

/// Parses an RSS document into its items, in document order.
///
/// # Errors
///
/// - [`FeedError::Format`] if the root element is not `<rss>`, it has no
///   `<channel>`, or the markup is malformed or truncated
/// - [`FeedError::Io`] if reading from `input` fails
pub fn parse_feed<R: BufRead>(input: R) -> Result<FeedItems, FeedError> {
    let items = FeedReader::new(input).read_feed()?;
    Ok(items.into())
}

/// Owned view of the events the state machine reacts to.
enum Token {
    Start(BytesStart<'static>),
    End,
    Text(BytesText<'static>),
    CData(BytesCData<'static>),
    Eof,
}

struct FeedReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> FeedReader<R> {
    fn new(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        // <tag/> arrives as Start followed by End, so depth tracking sees one shape
        reader.config_mut().expand_empty_elements = true;
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    fn next(&mut self) -> Result<Token, FeedError> {
        loop {
            self.buf.clear();
            let token = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => Token::Start(e.into_owned()),
                Event::End(_) => Token::End,
                Event::Text(e) => Token::Text(e.into_owned()),
                Event::CData(e) => Token::CData(e.into_owned()),
                Event::Eof => Token::Eof,
                // declarations, comments, processing instructions, doctype
                _ => continue,
            };
            return Ok(token);
        }
    }

    fn read_feed(&mut self) -> Result<Vec<FeedItem>, FeedError> {
        let root = loop {
            match self.next()? {
                Token::Start(e) => break e,
                Token::Text(t) if is_blank(&t) => {}
                Token::Text(_) | Token::CData(_) => {
                    return Err(FeedError::Format(
                        "text content before the root element".into(),
                    ))
                }
                Token::End => {
                    return Err(FeedError::Format("unexpected closing tag".into()));
                }
                Token::Eof => return Err(FeedError::Format("document is empty".into())),
            }
        };
        if root.name().as_ref() != RSS {
            return Err(FeedError::Format(format!(
                "expected <rss> root element, found <{}>",
                display_name(root.name().as_ref())
            )));
        }

        let mut items = Vec::new();
        let mut saw_channel = false;
        loop {
            match self.next()? {
                Token::Start(e) if e.name().as_ref() == CHANNEL => {
                    saw_channel = true;
                    self.read_channel(&mut items)?;
                }
                Token::Start(e) => self.skip(e.name().as_ref())?,
                Token::End => break,
                Token::Text(_) | Token::CData(_) => {}
                Token::Eof => return Err(unexpected_eof(RSS)),
            }
        }

        if !saw_channel {
            return Err(FeedError::Format("<rss> has no <channel> element".into()));
        }
        Ok(items)
    }

    fn read_channel(&mut self, items: &mut Vec<FeedItem>) -> Result<(), FeedError> {
        loop {
            match self.next()? {
                Token::Start(e) if e.name().as_ref() == ITEM => items.push(self.read_item()?),
                Token::Start(e) => self.skip(e.name().as_ref())?,
                Token::End => return Ok(()),
                Token::Text(_) | Token::CData(_) => {}
                Token::Eof => return Err(unexpected_eof(CHANNEL)),
            }
        }
    }

    fn read_item(&mut self) -> Result<FeedItem, FeedError> {
        let mut title = String::new();
        let mut description = String::new();
        let mut image_url = String::new();
        let mut link = String::new();
        let mut published_at = String::new();

        loop {
            match self.next()? {
                Token::Start(e) => match e.name().as_ref() {
                    b"title" => title = self.read_text(b"title")?,
                    b"description" => description = self.read_text(b"description")?,
                    b"link" => link = self.read_text(b"link")?,
                    b"pubDate" => published_at = self.read_text(b"pubDate")?,
                    MEDIA_CONTENT => {
                        image_url = self.url_attribute(&e)?;
                        self.skip(MEDIA_CONTENT)?;
                    }
                    other => self.skip(other)?,
                },
                Token::End => break,
                Token::Text(_) | Token::CData(_) => {}
                Token::Eof => return Err(unexpected_eof(ITEM)),
            }
        }

        Ok(FeedItem::new(
            title,
            description,
            image_url,
            link,
            published_at,
        ))
    }

    /// Reads the text of a leaf element up to its closing tag.
    ///
    /// Adjacent text and CDATA sections are joined. No text at all yields an
    /// empty string.
    fn read_text(&mut self, tag: &[u8]) -> Result<String, FeedError> {
        let mut value = String::new();
        loop {
            match self.next()? {
                Token::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| FeedError::Format(e.to_string()))?;
                    value.push_str(&text);
                }
                Token::CData(c) => {
                    let text = std::str::from_utf8(&c).map_err(|e| {
                        FeedError::Format(format!("invalid UTF-8 in CDATA section: {e}"))
                    })?;
                    value.push_str(text);
                }
                Token::End => return Ok(value),
                Token::Start(e) => {
                    return Err(FeedError::Format(format!(
                        "unexpected <{}> inside <{}>",
                        display_name(e.name().as_ref()),
                        display_name(tag)
                    )))
                }
                Token::Eof => return Err(unexpected_eof(tag)),
            }
        }
    }

    fn url_attribute(&self, e: &BytesStart<'_>) -> Result<String, FeedError> {
        let attr = e
            .try_get_attribute("url")
            .map_err(|err| FeedError::Format(err.to_string()))?;
        match attr {
            Some(attr) => Ok(attr
                .decode_and_unescape_value(self.reader.decoder())
                .map_err(|err| FeedError::Format(err.to_string()))?
                .into_owned()),
            None => Ok(String::new()),
        }
    }

    /// Consumes everything up to and including the end tag matching the
    /// start tag that was just read.
    fn skip(&mut self, tag: &[u8]) -> Result<(), FeedError> {
        let mut depth: usize = 1;
        while depth != 0 {
            match self.next()? {
                Token::Start(_) => depth += 1,
                Token::End => depth -= 1,
                Token::Text(_) | Token::CData(_) => {}
                Token::Eof => return Err(unexpected_eof(tag)),
            }
        }
        Ok(())
    }
}

fn is_blank(text: &[u8]) -> bool {
    text.iter().all(u8::is_ascii_whitespace)
}

fn display_name(name: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(name)
}

fn unexpected_eof(tag: &[u8]) -> FeedError {
    FeedError::Format(format!(
        "unexpected end of document inside <{}>",
        display_name(tag)
    ))
}
