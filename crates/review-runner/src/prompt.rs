use review_core::Batch;
use review_merge::{
    max_findings_for, ABSTRACTION_DIMENSION, HIGH_SCORE_ISSUES_NOTE_THRESHOLD,
    LOW_SCORE_FINDING_THRESHOLD,
};
use std::fmt::Write as _;
use std::path::Path;

const ISSUES_NOTE_KEY: &str = "issues_preventing_higher_score";

/// Render the subagent prompt for one investigation batch. `batch_index` is 0-based.
pub fn render_batch_prompt(
    repo_root: &Path,
    blind_packet: &Path,
    batch_index: usize,
    batch: &Batch,
) -> String {
    let position = batch_index + 1;
    let name = if batch.name.trim().is_empty() {
        format!("Batch {}", position)
    } else {
        batch.name.trim().to_string()
    };
    let dims: Vec<&str> = batch
        .dimensions
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .collect();
    let dim_text = if dims.is_empty() {
        "(none)".to_string()
    } else {
        dims.join(", ")
    };
    let files: Vec<&str> = batch
        .files_to_read
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    let findings_cap = max_findings_for(dims.len());

    let mut out = String::new();
    out.push_str("You are a focused subagent reviewer for a single investigation batch.\n\n");
    let _ = writeln!(out, "Repository root: {}", repo_root.display());
    let _ = writeln!(out, "Blind packet: {}", blind_packet.display());
    let _ = writeln!(out, "Batch index: {}", position);
    let _ = writeln!(out, "Batch name: {}", name);
    let _ = writeln!(out, "Batch dimensions: {}", dim_text);
    let _ = writeln!(out, "Batch rationale: {}", batch.why.trim());
    out.push_str("\nFiles assigned:\n");
    if files.is_empty() {
        out.push_str("- (none)\n");
    }
    for file in &files {
        let _ = writeln!(out, "- {}", file);
    }

    out.push_str("\nTask requirements:\n");
    out.push_str("1. Read the blind packet and follow its `system_prompt` constraints exactly.\n");
    out.push_str("2. Evaluate ONLY the listed files and ONLY the listed dimensions.\n");
    let _ = writeln!(
        out,
        "3. Return 0-{} high-quality findings for this batch (an empty array is allowed).",
        findings_cap
    );
    out.push_str("4. Broader or more severe findings MUST lower the matching dimension score.\n");
    let _ = writeln!(
        out,
        "5. Any dimension scored below {:.1} MUST include at least one finding with the same `dimension` and a non-empty actionable `suggestion`; otherwise its score is discarded.",
        LOW_SCORE_FINDING_THRESHOLD
    );
    out.push_str("6. Every finding must include `dimension`, `identifier`, `summary`, `evidence`, `suggestion` and `confidence`.\n");
    out.push_str("7. Every finding must include `impact_scope` and `fix_scope`.\n");
    out.push_str("8. Every scored dimension MUST include dimension_notes with concrete evidence.\n");
    let _ = writeln!(
        out,
        "9. If a dimension score is >{:.1}, include `{}` in its dimension note.",
        HIGH_SCORE_ISSUES_NOTE_THRESHOLD, ISSUES_NOTE_KEY
    );
    out.push_str("10. Use exactly one decimal place for every assessment and sub-axis score.\n");
    out.push_str("11. Ignore prior chat context and any target-threshold assumptions.\n");
    out.push_str("12. Do not edit repository files.\n");
    out.push_str("13. Return ONLY valid JSON, no markdown fences.\n\n");

    out.push_str("Scope enums:\n");
    out.push_str("- impact_scope: \"local\" | \"module\" | \"subsystem\" | \"codebase\"\n");
    out.push_str("- fix_scope: \"single_edit\" | \"multi_file_refactor\" | \"architectural_change\"\n\n");

    out.push_str("Output schema:\n{\n");
    let _ = writeln!(out, "  \"batch\": {},", serde_json::Value::String(name.clone()));
    let _ = writeln!(out, "  \"batch_index\": {},", position);
    out.push_str("  \"assessments\": {\"<dimension>\": <0-100 with one decimal place>},\n");
    out.push_str("  \"dimension_notes\": {\n");
    out.push_str("    \"<dimension>\": {\n");
    out.push_str("      \"evidence\": [\"specific code observations\"],\n");
    out.push_str("      \"impact_scope\": \"local|module|subsystem|codebase\",\n");
    out.push_str("      \"fix_scope\": \"single_edit|multi_file_refactor|architectural_change\",\n");
    out.push_str("      \"confidence\": \"high|medium|low\",\n");
    let _ = writeln!(
        out,
        "      \"{}\": \"required when score >{:.1}\",",
        ISSUES_NOTE_KEY, HIGH_SCORE_ISSUES_NOTE_THRESHOLD
    );
    let _ = writeln!(
        out,
        "      \"sub_axes\": {{\"abstraction_leverage\": 0-100, \"indirection_cost\": 0-100, \"interface_honesty\": 0-100}}  // only for {}",
        ABSTRACTION_DIMENSION
    );
    out.push_str("    }\n  },\n");
    out.push_str("  \"findings\": [{\n");
    out.push_str("    \"dimension\": \"<dimension>\",\n");
    out.push_str("    \"identifier\": \"short_id\",\n");
    out.push_str("    \"summary\": \"one-line defect summary\",\n");
    out.push_str("    \"related_files\": [\"relative/path\"],\n");
    out.push_str("    \"evidence\": [\"specific code observation\"],\n");
    out.push_str("    \"suggestion\": \"concrete fix recommendation\",\n");
    out.push_str("    \"confidence\": \"high|medium|low\",\n");
    out.push_str("    \"impact_scope\": \"local|module|subsystem|codebase\",\n");
    out.push_str("    \"fix_scope\": \"single_edit|multi_file_refactor|architectural_change\"\n");
    out.push_str("  }]\n}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_files_dimensions_and_enums() {
        let batch = Batch {
            name: "Naming pass".to_string(),
            dimensions: vec!["naming".to_string(), "clarity".to_string()],
            why: "helpers look inconsistent".to_string(),
            files_to_read: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
        };
        let prompt = render_batch_prompt(Path::new("/repo"), Path::new("/state/blind.json"), 1, &batch);
        assert!(prompt.contains("Batch index: 2\n"));
        assert!(prompt.contains("Batch dimensions: naming, clarity\n"));
        assert!(prompt.contains("- src/a.rs\n- src/b.rs\n"));
        assert!(prompt.contains("Return 0-10 high-quality findings"));
        assert!(prompt.contains("\"multi_file_refactor\""));
        assert!(prompt.contains("\"batch\": \"Naming pass\","));
    }

    #[test]
    fn prompt_requires_findings_for_low_scores() {
        let prompt = render_batch_prompt(Path::new("/r"), Path::new("/b"), 0, &Batch::default());
        assert!(prompt.contains(
            "5. Any dimension scored below 95.0 MUST include at least one finding with the same `dimension`"
        ));
        assert!(prompt.contains("13. Return ONLY valid JSON"));
    }

    #[test]
    fn unnamed_batch_without_files_gets_placeholders() {
        let prompt = render_batch_prompt(Path::new("/r"), Path::new("/b"), 0, &Batch::default());
        assert!(prompt.contains("Batch name: Batch 1\n"));
        assert!(prompt.contains("Files assigned:\n- (none)\n"));
        assert!(prompt.contains("Batch dimensions: (none)\n"));
    }
}
