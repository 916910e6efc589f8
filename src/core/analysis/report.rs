use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use super::statistics::DatasetStatistics;
use crate::error::{DatasetError, Result};

pub const CSV_HEADER: &str = "Class ID,Class Name,Instance Count,Image Count,Percentage";

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Per-class rows in CSV form, ordered by class id.
pub fn render_csv(stats: &DatasetStatistics) -> String {
    let mut out = String::new();
    out.push_str(CSV_HEADER);
    out.push('\n');
    for class in stats.class_stats.values() {
        let _ = writeln!(
            out,
            "{},{},{},{},{:.2}",
            class.class_id,
            csv_field(&class.class_name),
            class.instance_count,
            class.image_count,
            class.percentage
        );
    }
    out
}

/// Self-contained HTML report: summary boxes plus the class distribution table.
pub fn render_html(stats: &DatasetStatistics, title: &str) -> String {
    let title = html_escape(title);
    let mut out = String::new();
    let _ = writeln!(out, "<!DOCTYPE html>");
    let _ = writeln!(out, "<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">");
    let _ = writeln!(out, "<title>{}</title>", title);
    out.push_str(
        "<style>\n\
         body { font-family: sans-serif; margin: 2em; color: #222; }\n\
         .stats { display: flex; flex-wrap: wrap; gap: 1em; margin-bottom: 2em; }\n\
         .stat-box { background: #f3f5f8; border-radius: 6px; padding: 1em 1.5em; min-width: 9em; }\n\
         .stat-value { font-size: 1.6em; font-weight: bold; }\n\
         .stat-label { color: #666; }\n\
         table { border-collapse: collapse; width: 100%; }\n\
         th, td { border: 1px solid #ddd; padding: 6px 10px; text-align: left; }\n\
         th { background: #4a6fa5; color: white; }\n\
         tr:nth-child(even) { background: #f9f9f9; }\n\
         .bar { background: #4a6fa5; height: 10px; }\n\
         </style>\n</head>\n<body>\n",
    );
    let _ = writeln!(out, "<h1>{}</h1>", title);

    let boxes = [
        ("Total Images", stats.total_images.to_string()),
        ("Train", stats.train_images.to_string()),
        ("Val", stats.val_images.to_string()),
        ("Test", stats.test_images.to_string()),
        ("Annotations", stats.total_annotations.to_string()),
        ("Classes", stats.class_stats.len().to_string()),
        (
            "Avg / Image",
            format!("{:.2}", stats.average_annotations_per_image),
        ),
        (
            "Min / Max",
            format!(
                "{} / {}",
                stats.min_annotations_per_image, stats.max_annotations_per_image
            ),
        ),
        ("Unlabeled", stats.images_without_labels.to_string()),
    ];
    out.push_str("<div class=\"stats\">\n");
    for (label, value) in boxes {
        let _ = writeln!(
            out,
            "<div class=\"stat-box\"><div class=\"stat-value\">{}</div><div class=\"stat-label\">{}</div></div>",
            value, label
        );
    }
    out.push_str("</div>\n");

    out.push_str("<h2>Class Distribution</h2>\n<table>\n");
    out.push_str(
        "<tr><th>Class ID</th><th>Class Name</th><th>Instances</th><th>Images</th><th>Percentage</th><th></th></tr>\n",
    );
    for class in stats.classes_by_frequency() {
        let _ = writeln!(
            out,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.2}%</td><td><div class=\"bar\" style=\"width: {:.1}%\"></div></td></tr>",
            class.class_id,
            html_escape(&class.class_name),
            class.instance_count,
            class.image_count,
            class.percentage,
            class.percentage.clamp(0.0, 100.0)
        );
    }
    out.push_str("</table>\n</body>\n</html>\n");
    out
}

pub fn write_csv(stats: &DatasetStatistics, path: &Path) -> Result<()> {
    fs::write(path, render_csv(stats)).map_err(|e| DatasetError::io(path, e))?;
    info!("Wrote CSV report to {:?}", path);
    Ok(())
}

pub fn write_html(stats: &DatasetStatistics, title: &str, path: &Path) -> Result<()> {
    fs::write(path, render_html(stats, title)).map_err(|e| DatasetError::io(path, e))?;
    info!("Wrote HTML report to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::statistics::ClassStatistics;

    fn stats() -> DatasetStatistics {
        let mut stats = DatasetStatistics {
            total_images: 2,
            train_images: 2,
            total_annotations: 4,
            ..Default::default()
        };
        stats.class_stats.insert(
            0,
            ClassStatistics {
                class_id: 0,
                class_name: "car, red".to_string(),
                instance_count: 3,
                image_count: 2,
                percentage: 75.0,
            },
        );
        stats.class_stats.insert(
            1,
            ClassStatistics {
                class_id: 1,
                class_name: "<script>".to_string(),
                instance_count: 1,
                image_count: 1,
                percentage: 25.0,
            },
        );
        stats
    }

    #[test]
    fn test_csv_header_and_quoting() {
        let csv = render_csv(&stats());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "0,\"car, red\",3,2,75.00");
        assert_eq!(lines[2], "1,<script>,1,1,25.00");
    }

    #[test]
    fn test_html_is_escaped() {
        let html = render_html(&stats(), "Report & Summary");
        assert!(html.contains("<title>Report &amp; Summary</title>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<td><script>"));
        assert!(html.contains("Class Distribution"));
    }
}
