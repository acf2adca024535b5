//! Rich-text format attributes for characters, blocks and lists

use serde::{Deserialize, Serialize};

/// RGBA colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

/// Character-level attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharFormat {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub font_family: Option<String>,
    /// Point size
    pub font_size: Option<u16>,
    pub foreground: Option<Color>,
    pub background: Option<Color>,
}

impl CharFormat {
    pub fn bold() -> Self {
        Self {
            bold: true,
            ..Self::default()
        }
    }
}

/// Horizontal alignment of a paragraph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Alignment {
    #[default]
    Left,
    Right,
    Center,
    Justify,
}

impl std::str::FromStr for Alignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "left" => Ok(Alignment::Left),
            "right" => Ok(Alignment::Right),
            "center" | "centre" => Ok(Alignment::Center),
            "justify" => Ok(Alignment::Justify),
            _ => Err(format!("Unknown alignment: {}", s)),
        }
    }
}

/// How a line height value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineHeightKind {
    /// Percentage of the single line height
    Proportional,
    /// Fixed height in pixels
    Fixed,
    /// Minimum height in pixels
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineHeight {
    pub value: u32,
    pub kind: LineHeightKind,
}

/// Paragraph-level attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockFormat {
    pub alignment: Alignment,
    pub line_height: Option<LineHeight>,
    pub indent: u16,
}

/// Bullet or numbering style of a list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListStyle {
    #[default]
    Disc,
    Circle,
    Square,
    Decimal,
    LowerAlpha,
    UpperAlpha,
    LowerRoman,
    UpperRoman,
}

impl std::str::FromStr for ListStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disc" | "bullet" => Ok(ListStyle::Disc),
            "circle" => Ok(ListStyle::Circle),
            "square" => Ok(ListStyle::Square),
            "decimal" | "number" => Ok(ListStyle::Decimal),
            "lower-alpha" => Ok(ListStyle::LowerAlpha),
            "upper-alpha" => Ok(ListStyle::UpperAlpha),
            "lower-roman" => Ok(ListStyle::LowerRoman),
            "upper-roman" => Ok(ListStyle::UpperRoman),
            _ => Err(format!("Unknown list style: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListFormat {
    pub style: ListStyle,
    pub indent: u16,
}

impl ListFormat {
    pub fn new(style: ListStyle) -> Self {
        Self { style, indent: 1 }
    }
}
