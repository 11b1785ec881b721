//! Prompt assembly.
//!
//! Every chunk is sent as `instruction + TEXT_SECTION_HEADER + chunk`. The
//! chunker sizes chunks against [`prompt_template`], the same string with
//! the chunk left empty, so the template's token cost is accounted for once.
//!
//! Callers normally supply their own instruction; the defaults here are used
//! when none is given.

/// Separates the instruction from the chunk text.
pub const TEXT_SECTION_HEADER: &str = "### TEXT TO PROCESS";

/// Default instruction for extraction jobs. Matches the field names of
/// [`crate::config::ExtractionSchema::rules`].
pub const DEFAULT_EXTRACTION_INSTRUCTION: &str = r#"You extract rules from policy and regulatory documents.

Read the text below and return every rule, requirement or obligation it states.

Return ONLY a JSON array. Each element is an object with exactly these keys:
  "major_section" - the top-level section heading the rule belongs to
  "minor_section" - the sub-section heading, or "" if there is none
  "rule"          - the rule itself, stated completely in one or two sentences

Rules:
- Do not invent rules that are not in the text.
- Do not wrap the array in markdown fences or add commentary.
- If the text contains no rules, return []."#;

/// Default instruction for documents on either side of a comparison job.
/// Matches [`crate::config::ComparisonKey`]'s default field names.
pub const DEFAULT_COMPARISON_INSTRUCTION: &str = r#"You extract comparable attributes from documents.

Read the text below and list every attribute it defines (a fee, a limit, a date, a term, a requirement).

Return ONLY a JSON array. Each element is an object with exactly these keys:
  "Category"  - the broad area the attribute belongs to (e.g. "Fees", "Eligibility")
  "Attribute" - a short, stable name for the attribute (e.g. "Late payment fee")
  "Value"     - the value or wording the document gives for it

Use the same Category and Attribute wording for the same concept every time.
Do not wrap the array in markdown fences or add commentary. If nothing applies, return []."#;

/// The full prompt for one chunk.
pub fn build_prompt(instruction: &str, chunk: &str) -> String {
    format!("{instruction}\n\n{TEXT_SECTION_HEADER}\n{chunk}")
}

/// The prompt with an empty chunk, used to budget chunk size.
pub fn prompt_template(instruction: &str) -> String {
    build_prompt(instruction, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_layout() {
        let p = build_prompt("Find rules.", "Section 1. Pay on time.");
        assert_eq!(
            p,
            "Find rules.\n\n### TEXT TO PROCESS\nSection 1. Pay on time."
        );
    }

    #[test]
    fn template_is_prompt_prefix() {
        let instruction = DEFAULT_EXTRACTION_INSTRUCTION;
        let full = build_prompt(instruction, "chunk");
        assert!(full.starts_with(&prompt_template(instruction)));
    }

    #[test]
    fn defaults_name_their_fields() {
        for field in ["major_section", "minor_section", "rule"] {
            assert!(DEFAULT_EXTRACTION_INSTRUCTION.contains(field));
        }
        for field in ["Category", "Attribute"] {
            assert!(DEFAULT_COMPARISON_INSTRUCTION.contains(field));
        }
    }
}
