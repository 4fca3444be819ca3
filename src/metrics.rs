//! Character, word and sentence error rates.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub cer: f64,
    pub wer: f64,
    pub ser: f64,
}

/// Levenshtein distance between two sequences.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, x) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(x != y);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

fn normalized(distance: usize, reference: usize, prediction: usize) -> f64 {
    let length = reference.max(prediction);
    if length == 0 {
        0.0
    } else {
        distance as f64 / length as f64
    }
}

/// Mean error rates of `predicts` against `ground_truth`, pairwise.
///
/// Each pair's distance is divided by the longer of the two sequences, so
/// every rate lies in `[0, 1]`.
pub fn ocr_metrics(predicts: &[String], ground_truth: &[String]) -> Result<Metrics> {
    if predicts.len() != ground_truth.len() {
        return Err(Error::Config(format!(
            "{} predictions for {} ground truth sentences",
            predicts.len(),
            ground_truth.len()
        )));
    }
    if predicts.is_empty() {
        return Ok(Metrics { cer: 0.0, wer: 0.0, ser: 0.0 });
    }

    let (mut cer, mut wer, mut ser) = (0.0, 0.0, 0.0);
    for (pd, gt) in predicts.iter().zip(ground_truth) {
        let (pd, gt) = (pd.trim(), gt.trim());

        let pd_chars: Vec<char> = pd.chars().collect();
        let gt_chars: Vec<char> = gt.chars().collect();
        cer += normalized(edit_distance(&pd_chars, &gt_chars), gt_chars.len(), pd_chars.len());

        let pd_words: Vec<&str> = pd.split_whitespace().collect();
        let gt_words: Vec<&str> = gt.split_whitespace().collect();
        wer += normalized(edit_distance(&pd_words, &gt_words), gt_words.len(), pd_words.len());

        ser += if pd == gt { 0.0 } else { 1.0 };
    }

    let n = predicts.len() as f64;
    Ok(Metrics {
        cer: cer / n,
        wer: wer / n,
        ser: ser / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_edit_distance() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(edit_distance(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(edit_distance(&chars(""), &chars("abc")), 3);
        assert_eq!(edit_distance(&chars("abc"), &chars("")), 3);
        assert_eq!(edit_distance(&chars("same"), &chars("same")), 0);
        assert_eq!(edit_distance(&["a", "b"], &["b", "a"]), 2);
    }

    #[test]
    fn test_perfect_predictions() -> Result<()> {
        let gt = strings(&["the cat sat", "hello"]);
        let m = ocr_metrics(&gt, &gt)?;
        assert_eq!(m, Metrics { cer: 0.0, wer: 0.0, ser: 0.0 });
        Ok(())
    }

    #[test]
    fn test_partial_errors() -> Result<()> {
        let predicts = strings(&["the cat sad", "hello"]);
        let gt = strings(&["the cat sat", "hello"]);
        let m = ocr_metrics(&predicts, &gt)?;
        assert!((m.cer - (1.0 / 11.0) / 2.0).abs() < 1e-12);
        assert!((m.wer - (1.0 / 3.0) / 2.0).abs() < 1e-12);
        assert!((m.ser - 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_length_mismatch_is_error() {
        assert!(ocr_metrics(&strings(&["a"]), &strings(&["a", "b"])).is_err());
    }
}
