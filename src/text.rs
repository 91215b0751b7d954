//! Text normalization and symbol-id conversion.
//!
//! The symbol table always places the pad symbol at id 0 so zero-padded text
//! batches never alias a real character.

use crate::config::CharactersConfig;
use anyhow::Result;
use std::collections::HashMap;

/// Cleaner applied to raw transcripts before symbol lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCleaner {
    /// Lowercase and collapse whitespace.
    Basic,
    /// Basic cleaning plus abbreviation and number expansion.
    English,
}

impl TextCleaner {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "basic" | "basic_cleaners" => Ok(Self::Basic),
            "english" | "english_cleaners" => Ok(Self::English),
            other => anyhow::bail!("Unknown text cleaner: {other}"),
        }
    }

    pub fn clean(self, text: &str) -> String {
        let text = text.replace(['\n', '\r', '\t'], " ");
        let text = match self {
            Self::Basic => text.to_lowercase(),
            Self::English => {
                let lowered = to_ascii_lossy(&text).to_lowercase();
                let expanded = expand_abbreviations(&lowered);
                expand_numbers(&expanded)
            }
        };
        collapse_whitespace(&text)
    }
}

/// Symbol inventory with a stable id assignment.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<char>,
    ids: HashMap<char, i64>,
    bos: char,
    eos: char,
}

impl SymbolTable {
    pub fn new(config: &CharactersConfig) -> Self {
        let mut symbols = Vec::new();
        let ordered = [config.pad, config.eos, config.bos]
            .into_iter()
            .chain(config.characters.chars())
            .chain(config.punctuations.chars());
        for symbol in ordered {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        let ids = symbols
            .iter()
            .enumerate()
            .map(|(idx, symbol)| (*symbol, idx as i64))
            .collect();
        Self {
            symbols,
            ids,
            bos: config.bos,
            eos: config.eos,
        }
    }

    /// Number of symbols, which is also the embedding table size.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Map text to ids, dropping characters outside the inventory.
    pub fn encode(&self, text: &str, add_bos_eos: bool) -> Vec<i64> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if add_bos_eos {
            ids.push(self.ids[&self.bos]);
        }
        ids.extend(text.chars().filter_map(|c| self.ids.get(&c).copied()));
        if add_bos_eos {
            ids.push(self.ids[&self.eos]);
        }
        ids
    }

    pub fn decode(&self, ids: &[i64]) -> String {
        ids.iter()
            .filter_map(|id| usize::try_from(*id).ok())
            .filter_map(|id| self.symbols.get(id))
            .collect()
    }
}

/// Full text front end: cleaner followed by the symbol table.
#[derive(Debug, Clone)]
pub struct TextFrontend {
    cleaner: TextCleaner,
    symbols: SymbolTable,
    add_bos_eos: bool,
}

impl TextFrontend {
    pub fn new(cleaner: TextCleaner, symbols: SymbolTable, add_bos_eos: bool) -> Self {
        Self {
            cleaner,
            symbols,
            add_bos_eos,
        }
    }

    pub fn from_config(config: &crate::config::DataConfig) -> Result<Self> {
        Ok(Self::new(
            TextCleaner::from_name(&config.text_cleaner)?,
            SymbolTable::new(&config.characters),
            config.enable_eos_bos_chars,
        ))
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Clean and encode a transcript.
    ///
    /// # Errors
    ///
    /// Fails when nothing of the text survives cleaning and symbol lookup.
    pub fn text_to_ids(&self, text: &str) -> Result<Vec<i64>> {
        let cleaned = self.cleaner.clean(text);
        let ids = self.symbols.encode(&cleaned, self.add_bos_eos);
        let content = if self.add_bos_eos { ids.len() - 2 } else { ids.len() };
        if content == 0 {
            anyhow::bail!("Text has no known symbols after cleaning: {text:?}");
        }
        Ok(ids)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn to_ascii_lossy(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => 'a',
            'À' | 'Á' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'A',
            'è' | 'é' | 'ê' | 'ë' => 'e',
            'È' | 'É' | 'Ê' | 'Ë' => 'E',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'ò' | 'ó' | 'ô' | 'ö' | 'õ' => 'o',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            '’' | '‘' => '\'',
            '“' | '”' => '"',
            '–' | '—' => '-',
            other => other,
        })
        .collect()
}

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("mrs", "misess"),
    ("mr", "mister"),
    ("dr", "doctor"),
    ("st", "saint"),
    ("co", "company"),
    ("jr", "junior"),
    ("maj", "major"),
    ("gen", "general"),
    ("drs", "doctors"),
    ("rev", "reverend"),
    ("lt", "lieutenant"),
    ("hon", "honorable"),
    ("sgt", "sergeant"),
    ("capt", "captain"),
    ("esq", "esquire"),
    ("ltd", "limited"),
    ("col", "colonel"),
    ("ft", "fort"),
];

fn expand_abbreviations(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let Some(stem) = word.strip_suffix('.') else {
                return word.to_string();
            };
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == stem)
                .map(|(_, full)| full.to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_numbers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut digits = String::new();
    let mut chars = text.chars().chain(std::iter::once('\0')).peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        // Thousands separator.
        if c == ',' && !digits.is_empty() && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            continue;
        }
        if !digits.is_empty() {
            match digits.parse::<u64>() {
                Ok(value) => out.push_str(&number_to_words(value)),
                Err(_) => out.push_str(&digits),
            }
            digits.clear();
        }
        if c != '\0' {
            out.push(c);
        }
    }
    out
}

fn number_to_words(value: u64) -> String {
    const ONES: [&str; 20] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen",
        "eighteen", "nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];
    const SCALES: [(u64, &str); 4] = [
        (1_000_000_000_000, "trillion"),
        (1_000_000_000, "billion"),
        (1_000_000, "million"),
        (1_000, "thousand"),
    ];

    if value < 20 {
        return ONES[value as usize].to_string();
    }
    if value < 100 {
        let tens = TENS[(value / 10) as usize];
        return match value % 10 {
            0 => tens.to_string(),
            ones => format!("{tens} {}", ONES[ones as usize]),
        };
    }
    if value < 1000 {
        let head = format!("{} hundred", ONES[(value / 100) as usize]);
        return match value % 100 {
            0 => head,
            rest => format!("{head} {}", number_to_words(rest)),
        };
    }
    for (scale, name) in SCALES {
        if value >= scale {
            let head = format!("{} {name}", number_to_words(value / scale));
            return match value % scale {
                0 => head,
                rest => format!("{head} {}", number_to_words(rest)),
            };
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontend(add_bos_eos: bool) -> TextFrontend {
        TextFrontend::new(
            TextCleaner::English,
            SymbolTable::new(&CharactersConfig::default()),
            add_bos_eos,
        )
    }

    #[test]
    fn pad_symbol_is_id_zero() {
        let table = SymbolTable::new(&CharactersConfig::default());
        assert_eq!(table.encode("_", false), vec![0]);
        assert!(!table.encode("a", false).contains(&0));
    }

    #[test]
    fn english_cleaner_expands_numbers_and_abbreviations() {
        let cleaned = TextCleaner::English.clean("Dr. Smith owns 1,204   cats");
        assert_eq!(cleaned, "doctor smith owns one thousand two hundred four cats");
    }

    #[test]
    fn bos_eos_wrap_encoded_text() {
        let ids = frontend(true).text_to_ids("Hi").expect("encode");
        let table = SymbolTable::new(&CharactersConfig::default());
        assert_eq!(table.decode(&ids), "^hi~");
    }

    #[test]
    fn text_without_known_symbols_is_rejected() {
        assert!(frontend(false).text_to_ids("日本").is_err());
    }

    #[test]
    fn unknown_cleaner_name_fails() {
        assert!(TextCleaner::from_name("klingon").is_err());
    }
}
