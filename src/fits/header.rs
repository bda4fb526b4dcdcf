use serde::Serialize;
use std::ffi::{c_char, CStr, CString};
use std::fmt;

use fitsio::errors::check_status as fits_check_status;

use super::FitsError;

/// Length of one header record
pub const CARD_LEN: usize = 80;

/// Large enough for any record, value or comment cfitsio hands back
const BUFFER_LEN: usize = CARD_LEN + 1;

/// Comment cards cfitsio writes into every primary header it creates
const BOILERPLATE: &[&str] = &[
    "  FITS (Flexible Image Transport System) format is defined in 'Astronomy",
    "  and Astrophysics', volume 376, page 359; bibcode: 2001A&A...376..359H",
];

/// Value of a header keyword
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    Undefined,
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Real(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    /// Interpret the value field cfitsio split off a record
    fn parse(text: &str) -> Value {
        let text = text.trim();
        if let Some(quoted) = text.strip_prefix('\'') {
            let inner = quoted.strip_suffix('\'').unwrap_or(quoted);
            return Value::Str(inner.replace("''", "'").trim_end().to_string());
        }
        match text {
            "" => Value::Undefined,
            "T" => Value::Logical(true),
            "F" => Value::Logical(false),
            _ => {
                if let Ok(n) = text.parse::<i64>() {
                    Value::Integer(n)
                } else if let Ok(f) = text.replace(['D', 'd'], "E").parse::<f64>() {
                    Value::Real(f)
                } else {
                    // complex values
                    Value::Undefined
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Logical(true) => write!(f, "T"),
            Value::Logical(false) => write!(f, "F"),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Real(v) => write!(f, "{:E}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Undefined => Ok(()),
        }
    }
}

fn c_buffer() -> Vec<u8> {
    vec![0u8; BUFFER_LEN]
}

fn buffer_text(buffer: &[u8]) -> String {
    CStr::from_bytes_until_nul(buffer)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One header record as cfitsio stores it.
///
/// The record text is kept verbatim so that copying a card into another HDU
/// never reformats it.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    record: String,
    keyword: String,
    value: Option<Value>,
    comment: Option<String>,
}

impl Card {
    /// Split a record into keyword, value and comment
    pub fn from_record(record: &str) -> Result<Card, FitsError> {
        let record: String = record
            .chars()
            .take(CARD_LEN)
            .map(|c| if c.is_ascii_graphic() { c } else { ' ' })
            .collect::<String>()
            .trim_end()
            .to_string();
        let keyword = record.get(..8).unwrap_or(&record).trim_end().to_string();

        let valued = record.get(8..10) == Some("= ")
            && !matches!(keyword.as_str(), "HISTORY" | "COMMENT" | "" | "CONTINUE")
            && !keyword.starts_with("HIERARCH");
        if !valued {
            let text = record.get(8..).unwrap_or("").to_string();
            return Ok(Card {
                record,
                keyword,
                value: None,
                comment: Some(text),
            });
        }

        let mut card = CString::new(record.as_str())?.into_bytes_with_nul();
        let mut value = c_buffer();
        let mut comment = c_buffer();
        let mut status = 0;
        unsafe {
            // ffpsvc = fits_parse_value
            fitsio_sys::ffpsvc(
                card.as_mut_ptr() as *mut c_char,    /* I - card record        */
                value.as_mut_ptr() as *mut c_char,   /* O - value string       */
                comment.as_mut_ptr() as *mut c_char, /* O - comment string     */
                &mut status,                         /* IO - error status      */
            );
        }
        fits_check_status(status)?;

        let comment = buffer_text(&comment);
        Ok(Card {
            record,
            keyword,
            value: Some(Value::parse(&buffer_text(&value))),
            comment: (!comment.is_empty()).then_some(comment),
        })
    }

    /// An integer-valued card formatted by cfitsio
    pub fn integer(keyword: &str, value: i64, comment: Option<&str>) -> Result<Card, FitsError> {
        let keyname = CString::new(keyword)?;
        let mut value = CString::new(value.to_string())?.into_bytes_with_nul();
        let comment = comment.map(CString::new).transpose()?;
        let mut record = c_buffer();
        let mut status = 0;
        unsafe {
            // ffmkky = fits_make_key
            fitsio_sys::ffmkky(
                keyname.as_ptr(),                                           /* I - keyword name    */
                value.as_mut_ptr() as *mut c_char,                          /* I - keyword value   */
                comment.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()), /* I - comment */
                record.as_mut_ptr() as *mut c_char,                         /* O - card record     */
                &mut status,                                                /* IO - error status   */
            );
        }
        fits_check_status(status)?;
        Card::from_record(&buffer_text(&record))
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn is_commentary(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_blank(&self) -> bool {
        self.record.is_empty()
    }

    /// The record text without trailing blanks
    pub fn record(&self) -> &str {
        &self.record
    }

    /// Same card under another keyword, used when axes are renumbered
    pub fn renamed(&self, keyword: &str) -> Result<Card, FitsError> {
        let rest = self.record.get(8..).unwrap_or("");
        Card::from_record(&format!("{:<8}{}", keyword.to_ascii_uppercase(), rest))
    }

    /// Cards cfitsio adds to every primary it creates
    pub fn is_boilerplate(&self) -> bool {
        self.keyword == "COMMENT"
            && BOILERPLATE
                .iter()
                .any(|text| self.comment.as_deref() == Some(*text))
    }
}

/// Broad classification of an HDU by its first keyword
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HduKind {
    Primary,
    Image,
    BinTable,
    AsciiTable,
    Other(String),
}

impl fmt::Display for HduKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HduKind::Primary => write!(f, "PRIMARY"),
            HduKind::Image => write!(f, "IMAGE"),
            HduKind::BinTable => write!(f, "BINTABLE"),
            HduKind::AsciiTable => write!(f, "TABLE"),
            HduKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Ordered header records of one HDU, END excluded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Header { cards: Vec::new() }
    }

    pub fn from_cards(cards: Vec<Card>) -> Self {
        Header { cards }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    /// Index of the first valued card with this keyword
    pub fn find(&self, keyword: &str) -> Option<usize> {
        self.cards
            .iter()
            .position(|c| !c.is_commentary() && c.keyword() == keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.find(keyword).is_some()
    }

    pub fn card(&self, keyword: &str) -> Option<&Card> {
        self.find(keyword).map(|i| &self.cards[i])
    }

    pub fn get(&self, keyword: &str) -> Option<&Value> {
        self.card(keyword).and_then(Card::value)
    }

    pub fn get_i64(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(Value::as_f64)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(Value::as_str)
    }

    pub fn get_bool(&self, keyword: &str) -> Option<bool> {
        self.get(keyword).and_then(Value::as_bool)
    }

    pub fn require_i64(&self, keyword: &str) -> Result<i64, FitsError> {
        self.get_i64(keyword)
            .ok_or_else(|| FitsError::MissingKeyword(keyword.to_string()))
    }

    pub fn kind(&self) -> HduKind {
        if self.get_bool("SIMPLE").is_some() {
            return HduKind::Primary;
        }
        match self.get_str("XTENSION").map(str::trim) {
            Some("IMAGE") => HduKind::Image,
            Some("BINTABLE") => HduKind::BinTable,
            Some("TABLE") => HduKind::AsciiTable,
            Some(other) => HduKind::Other(other.to_string()),
            None => HduKind::Other("UNKNOWN".to_string()),
        }
    }

    /// True for a binary table holding a tile-compressed image
    pub fn is_compressed_image(&self) -> bool {
        self.kind() == HduKind::BinTable && self.get_bool("ZIMAGE") == Some(true)
    }

    pub fn bitpix(&self) -> Result<i64, FitsError> {
        self.require_i64("BITPIX")
    }

    pub fn naxis(&self) -> Result<usize, FitsError> {
        axis_len("NAXIS", self.require_i64("NAXIS")?)
    }

    /// Axis lengths NAXIS1..NAXISn
    pub fn axes(&self) -> Result<Vec<usize>, FitsError> {
        self.indexed_axes("NAXIS")
    }

    /// BITPIX of the image itself, ZBITPIX for a compressed table
    pub fn image_bitpix(&self) -> Result<i64, FitsError> {
        if self.is_compressed_image() {
            self.require_i64("ZBITPIX")
        } else {
            self.bitpix()
        }
    }

    /// Image axis lengths, ZNAXISn for a compressed table
    pub fn image_axes(&self) -> Result<Vec<usize>, FitsError> {
        if self.is_compressed_image() {
            self.indexed_axes("ZNAXIS")
        } else {
            self.axes()
        }
    }

    /// Number of pixels in the image, zero when it has no axes
    pub fn pixel_count(&self) -> Result<usize, FitsError> {
        let axes = self.image_axes()?;
        if axes.is_empty() {
            return Ok(0);
        }
        axes.iter().try_fold(1usize, |total, &n| {
            total
                .checked_mul(n)
                .ok_or_else(|| FitsError::Malformed(format!("image of shape {:?} is too large", axes)))
        })
    }

    fn indexed_axes(&self, prefix: &str) -> Result<Vec<usize>, FitsError> {
        let naxis = axis_len(prefix, self.require_i64(prefix)?)?;
        (1..=naxis)
            .map(|i| {
                let key = format!("{}{}", prefix, i);
                axis_len(&key, self.require_i64(&key)?)
            })
            .collect()
    }
}

fn axis_len(keyword: &str, value: i64) -> Result<usize, FitsError> {
    usize::try_from(value)
        .map_err(|_| FitsError::Malformed(format!("{} = {} is not a valid length", keyword, value)))
}
