use std::fmt;

use hashbrown::HashSet;

/// The five sentiment classes reviews are sorted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sentiment::VeryNegative => "Very negative",
            Sentiment::Negative => "Negative",
            Sentiment::Neutral => "Neutral",
            Sentiment::Positive => "Positive",
            Sentiment::VeryPositive => "Very positive",
        })
    }
}

/// Classifies one item. The pipeline only counts calls; what the analyzer
/// does with the text is its own business. Returns `None` when the text
/// can't be classified.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, text: &str) -> Option<Sentiment>;
}

const POSITIVE: &[&str] = &[
    "amazing", "awesome", "beautiful", "best", "brilliant", "excellent",
    "fantastic", "favorite", "favourite", "fun", "good", "great", "happy",
    "love", "loved", "loves", "nice", "perfect", "recommend", "wonderful",
];

const NEGATIVE: &[&str] = &[
    "awful", "bad", "boring", "broke", "broken", "cheap", "disappointed",
    "disappointing", "hate", "hated", "horrible", "junk", "poor", "refund",
    "return", "returned", "terrible", "useless", "waste", "worst",
];

const NEGATIONS: &[&str] = &["not", "never", "no", "don't", "didn't", "isn't", "wasn't"];

/// Scores text by counting words from small positive and negative lists.
/// A negation flips the word right after it.
pub struct LexiconAnalyzer {
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
    negations: HashSet<&'static str>,
}

impl Default for LexiconAnalyzer {
    fn default() -> Self {
        Self {
            positive: POSITIVE.iter().copied().collect(),
            negative: NEGATIVE.iter().copied().collect(),
            negations: NEGATIONS.iter().copied().collect(),
        }
    }
}

impl Analyzer for LexiconAnalyzer {
    fn analyze(&self, text: &str) -> Option<Sentiment> {
        let words: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        if words.is_empty() {
            return None;
        }

        let mut score = 0i32;
        let mut negate = false;
        for word in &words {
            let polarity = if self.positive.contains(word.as_str()) {
                1
            } else if self.negative.contains(word.as_str()) {
                -1
            } else {
                0
            };
            score += if negate { -polarity } else { polarity };
            negate = self.negations.contains(word.as_str());
        }

        Some(match score {
            i32::MIN..=-2 => Sentiment::VeryNegative,
            -1 => Sentiment::Negative,
            0 => Sentiment::Neutral,
            1 => Sentiment::Positive,
            _ => Sentiment::VeryPositive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_word_balance() {
        let analyzer = LexiconAnalyzer::default();
        assert_eq!(analyzer.analyze("great"), Some(Sentiment::Positive));
        assert_eq!(
            analyzer.analyze("Great album, I love it!"),
            Some(Sentiment::VeryPositive)
        );
        assert_eq!(
            analyzer.analyze("arrived broken, total junk"),
            Some(Sentiment::VeryNegative)
        );
        assert_eq!(analyzer.analyze("it is a cd"), Some(Sentiment::Neutral));
    }

    #[test]
    fn negation_flips_the_next_word() {
        let analyzer = LexiconAnalyzer::default();
        assert_eq!(analyzer.analyze("not good"), Some(Sentiment::Negative));
        assert_eq!(analyzer.analyze("never bad"), Some(Sentiment::Positive));
    }

    #[test]
    fn empty_text_is_unclassified() {
        let analyzer = LexiconAnalyzer::default();
        assert_eq!(analyzer.analyze(""), None);
        assert_eq!(analyzer.analyze("  ...  "), None);
    }
}
