//! Space description parser
//!
//! ```text
//! space NAME dimensions DIM, ... key KEY REGIONS SUBSPACE*
//! space NAME key DIM [attributes DIM, ...] REGIONS SUBSPACE*
//!
//! DIM      := NAME [ "(" TYPE ")" ]            (default type: string)
//! TYPE     := string | int64 | list(POD) | set(POD) | map(POD, POD)
//! REGIONS  := (region PREFIX 0xMASK F)* [auto PREFIX F]
//! SUBSPACE := subspace NAME, ... [nosearch NAME, ...] REGIONS
//! ```
//!
//! The key subspace is always subspace 0. Dimensions whose type cannot be
//! searched are added to every subspace's nosearch list.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{Dimension, Region, Space, Subspace};
use crate::coordinator::partition::{plan_regions, AutoRegion, StaticRegion};

const KEY_TYPES: [&str; 2] = ["string", "int64"];
const SEARCHABLE_TYPES: [&str; 2] = ["string", "int64"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    LParen,
    RParen,
    Comma,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidSpaceDescription(msg.into())
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            c if c.is_whitespace() => {}
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !(c.is_ascii_alphanumeric() || c == '_') {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Word(text[start..end].to_string()));
                continue;
            }
            other => {
                return Err(invalid(format!(
                    "unexpected character {:?} at offset {}",
                    other, start
                )))
            }
        }
        chars.next();
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_word(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn describe_next(&self) -> String {
        match self.tokens.get(self.pos) {
            None => "end of input".to_string(),
            Some(Token::Word(w)) => format!("\"{}\"", w),
            Some(Token::LParen) => "\"(\"".to_string(),
            Some(Token::RParen) => "\")\"".to_string(),
            Some(Token::Comma) => "\",\"".to_string(),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_word() == Some(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(invalid(format!("expected {}, found {}", what, self.describe_next())))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(invalid(format!(
                "expected \"{}\", found {}",
                keyword,
                self.describe_next()
            )))
        }
    }

    fn word(&mut self, what: &str) -> Result<String> {
        match self.peek_word() {
            Some(w) => {
                let w = w.to_string();
                self.pos += 1;
                Ok(w)
            }
            None => Err(invalid(format!("expected {}, found {}", what, self.describe_next()))),
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        self.word(what)
    }

    fn integer(&mut self, what: &str) -> Result<u64> {
        let w = self.word(what)?;
        w.parse()
            .map_err(|_| invalid(format!("{} must be a decimal integer, got \"{}\"", what, w)))
    }

    fn hex(&mut self, what: &str) -> Result<u64> {
        let w = self.word(what)?;
        w.strip_prefix("0x")
            .filter(|digits| !digits.is_empty())
            .and_then(|digits| u64::from_str_radix(digits, 16).ok())
            .ok_or_else(|| invalid(format!("{} must be a 64-bit 0x hex number, got \"{}\"", what, w)))
    }

    fn prefix(&mut self) -> Result<u8> {
        let prefix = self.integer("region prefix")?;
        if prefix > 64 {
            return Err(invalid("regions must use 0 <= prefix <= 64"));
        }
        Ok(prefix as u8)
    }

    fn desired_f(&mut self) -> Result<u32> {
        let f = self.integer("replication factor")?;
        u32::try_from(f).map_err(|_| invalid(format!("replication factor {} is too large", f)))
    }

    fn identifier_list(&mut self, what: &str) -> Result<Vec<String>> {
        let mut names = vec![self.identifier(what)?];
        while self.eat(&Token::Comma) {
            names.push(self.identifier(what)?);
        }
        Ok(names)
    }

    fn pod(&mut self) -> Result<String> {
        let w = self.word("a primitive type")?;
        if KEY_TYPES.contains(&w.as_str()) {
            Ok(w)
        } else {
            Err(invalid(format!("\"{}\" is not string or int64", w)))
        }
    }

    fn datatype(&mut self) -> Result<String> {
        let w = self.word("a datatype")?;
        match w.as_str() {
            "string" | "int64" => Ok(w),
            "list" | "set" => {
                self.expect(Token::LParen, "\"(\"")?;
                let inner = self.pod()?;
                self.expect(Token::RParen, "\")\"")?;
                Ok(format!("{}({})", w, inner))
            }
            "map" => {
                self.expect(Token::LParen, "\"(\"")?;
                let key = self.pod()?;
                self.expect(Token::Comma, "\",\"")?;
                let value = self.pod()?;
                self.expect(Token::RParen, "\")\"")?;
                Ok(format!("map({},{})", key, value))
            }
            other => Err(invalid(format!("unknown datatype \"{}\"", other))),
        }
    }

    fn dimension(&mut self) -> Result<Dimension> {
        let name = self.identifier("a dimension name")?;
        let datatype = if self.eat(&Token::LParen) {
            let datatype = self.datatype()?;
            self.expect(Token::RParen, "\")\"")?;
            datatype
        } else {
            "string".to_string()
        };
        Ok(Dimension::new(name, datatype))
    }

    fn dimension_list(&mut self) -> Result<Vec<Dimension>> {
        let mut dims = vec![self.dimension()?];
        while self.eat(&Token::Comma) {
            dims.push(self.dimension()?);
        }
        Ok(dims)
    }

    fn regions(&mut self) -> Result<Vec<Region>> {
        let mut statics = Vec::new();
        while self.eat_keyword("region") {
            let prefix = self.prefix()?;
            let mask = self.hex("region mask")?;
            let desired_f = self.desired_f()?;
            statics.push(StaticRegion {
                prefix,
                mask,
                desired_f,
            });
        }
        let auto = if self.eat_keyword("auto") {
            let prefix = self.prefix()?;
            let desired_f = self.desired_f()?;
            Some(AutoRegion { prefix, desired_f })
        } else {
            None
        };
        plan_regions(&statics, auto)
    }

    fn subspace(&mut self) -> Result<Subspace> {
        let dimensions = self.identifier_list("a subspace dimension")?;
        let nosearch = if self.eat_keyword("nosearch") {
            self.identifier_list("a nosearch dimension")?
        } else {
            Vec::new()
        };
        let regions = self.regions()?;
        Ok(Subspace {
            dimensions,
            nosearch,
            regions,
        })
    }

    fn space(&mut self) -> Result<Space> {
        self.expect_keyword("space")?;
        let name = self.identifier("a space name")?;

        let (dimensions, key) = if self.eat_keyword("dimensions") {
            let dims = self.dimension_list()?;
            self.expect_keyword("key")?;
            let key = self.identifier("the key dimension")?;
            (dims, key)
        } else {
            self.expect_keyword("key")?;
            let key = self.dimension()?;
            let name = key.name.clone();
            let mut dims = vec![key];
            if self.eat_keyword("attributes") {
                dims.extend(self.dimension_list()?);
            }
            (dims, name)
        };

        let key_regions = self.regions()?;
        let mut subspaces = vec![Subspace {
            dimensions: vec![key.clone()],
            nosearch: Vec::new(),
            regions: key_regions,
        }];
        while self.eat_keyword("subspace") {
            subspaces.push(self.subspace()?);
        }
        if !self.at_end() {
            return Err(invalid(format!(
                "unexpected {} after space description",
                self.describe_next()
            )));
        }

        let mut space = Space {
            name,
            dimensions,
            subspaces,
        };
        validate(&mut space, &key)?;
        Ok(space)
    }
}

fn validate(space: &mut Space, key: &str) -> Result<()> {
    for (i, dim) in space.dimensions.iter().enumerate() {
        if space.dimensions[..i].iter().any(|d| d.name == dim.name) {
            return Err(invalid(format!("dimension {:?} is declared twice", dim.name)));
        }
    }
    let type_of = |name: &str| {
        space
            .dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.datatype.clone())
    };

    match type_of(key) {
        None => return Err(invalid("space key must be one of its dimensions")),
        Some(t) if !KEY_TYPES.contains(&t.as_str()) => {
            return Err(invalid("key must be a primitive datatype"))
        }
        Some(_) => {}
    }

    for subspace in space.subspaces.iter().skip(1) {
        for dim in &subspace.dimensions {
            match type_of(dim) {
                None => {
                    return Err(invalid(format!(
                        "subspace dimension {:?} must be one of its dimensions",
                        dim
                    )))
                }
                Some(t) if !SEARCHABLE_TYPES.contains(&t.as_str()) => {
                    return Err(invalid(format!(
                        "subspace dimension {:?} is not a searchable type",
                        dim
                    )))
                }
                Some(_) => {}
            }
        }
        for dim in &subspace.nosearch {
            if type_of(dim).is_none() {
                return Err(invalid(format!(
                    "nosearch dimension {:?} must be one of its dimensions",
                    dim
                )));
            }
        }
    }

    let unsearchable: Vec<String> = space
        .dimensions
        .iter()
        .filter(|d| !SEARCHABLE_TYPES.contains(&d.datatype.as_str()))
        .map(|d| d.name.clone())
        .collect();
    for subspace in &mut space.subspaces {
        for name in &unsearchable {
            if !subspace.nosearch.contains(name) {
                subspace.nosearch.push(name.clone());
            }
        }
    }
    Ok(())
}

/// Parse a space description into a partitioned [`Space`].
pub fn parse_space(text: &str) -> Result<Space> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };
    parser.space()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    fn err_kind(text: &str) -> ErrorKind {
        parse_space(text).unwrap_err().kind()
    }

    #[test]
    fn test_attributes_form() {
        let space = parse_space("space kv key k attributes v auto 0 0").unwrap();
        assert_eq!(space.name, "kv");
        assert_eq!(
            space.dimensions,
            vec![Dimension::new("k", "string"), Dimension::new("v", "string")]
        );
        assert_eq!(space.subspaces.len(), 1);
        let key = &space.subspaces[0];
        assert_eq!(key.dimensions, vec!["k".to_string()]);
        assert_eq!(key.regions.len(), 1);
        assert_eq!((key.regions[0].prefix, key.regions[0].desired_f), (0, 0));
    }

    #[test]
    fn test_dimensions_form_with_subspaces() {
        let text = "space phonebook \
                    dimensions username, first, last, phone (int64), tags (set(string)), \
                    attrs (map(string, int64)) \
                    key username auto 2 1 \
                    subspace first, last nosearch phone auto 1 2 \
                    subspace phone region 1 0x8000000000000000 0 auto 1 1";
        let space = parse_space(text).unwrap();
        assert_eq!(space.dimensions.len(), 6);
        assert_eq!(space.dimensions[4].datatype, "set(string)");
        assert_eq!(space.dimensions[5].datatype, "map(string,int64)");
        assert_eq!(space.subspaces.len(), 3);

        let key = &space.subspaces[0];
        assert_eq!(key.regions.len(), 4);
        assert_eq!(key.nosearch, vec!["tags".to_string(), "attrs".to_string()]);

        let names = &space.subspaces[1];
        assert_eq!(names.dimensions, vec!["first".to_string(), "last".to_string()]);
        assert_eq!(
            names.nosearch,
            vec!["phone".to_string(), "tags".to_string(), "attrs".to_string()]
        );
        assert!(names.regions.iter().all(|r| r.desired_f == 2));

        let phone = &space.subspaces[2];
        assert_eq!(phone.regions.len(), 2);
        assert_eq!(phone.regions[1].mask, 0x8000_0000_0000_0000);
        assert_eq!(phone.regions[1].desired_f, 0);
    }

    #[test]
    fn test_static_regions_with_auto_fill() {
        let space =
            parse_space("space kv key k region 1 0x8000000000000000 2 auto 1 3").unwrap();
        let regions = &space.subspaces[0].regions;
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].prefix, regions[0].mask, regions[0].desired_f), (1, 0, 3));
        assert_eq!(regions[1].desired_f, 2);
    }

    #[test]
    fn test_rejects_invalid_descriptions() {
        let cases = [
            "space kv dimensions a key k auto 0 0",
            "space kv dimensions k (list(string)) key k auto 0 0",
            "space kv key k attributes m (map(string,int64)) auto 0 0 subspace m auto 0 0",
            "space kv key k attributes v auto 0 0 subspace missing auto 0 0",
            "space kv key k auto 65 0",
            "space kv key k region 1 0x8000000000000000 0",
            "space kv key k region 1 0x8000 0 auto 1 0",
            "space kv key k auto 0 0 trailing",
            "space kv key k (float) auto 0 0",
            "space kv key k; auto 0 0",
            "space kv dimensions k, k key k auto 0 0",
            "space kv key k",
        ];
        for case in cases {
            assert_eq!(err_kind(case), ErrorKind::InvalidSpaceDescription, "{}", case);
        }
    }
}
