//! `kiln images` command.

use clap::Args;
use kiln_builder::oci::{ImageReference, StoredImage};
use kiln_builder::ImageStore;
use kiln_core::BuilderConfig;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Show untagged intermediate images too
    #[arg(short, long)]
    pub all: bool,
}

pub async fn execute(
    args: ImagesArgs,
    config: BuilderConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(&config)?;
    let images: Vec<StoredImage> = store
        .list_images()
        .await?
        .into_iter()
        .filter(|i| args.all || !i.names.is_empty())
        .collect();

    if args.quiet {
        for image in &images {
            println!("{}", output::short_id(&image.id));
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for image in &images {
        for row in rows(image) {
            table.add_row(row);
        }
    }
    println!("{table}");
    Ok(())
}

/// One table row per name; untagged images get a single `<none>` row.
fn rows(image: &StoredImage) -> Vec<Vec<String>> {
    let id = output::short_id(&image.id).to_string();
    let created = output::format_ago(&image.created);
    let size = output::format_bytes(image.size_bytes);

    let names: Vec<(String, String)> = if image.names.is_empty() {
        vec![("<none>".to_string(), "<none>".to_string())]
    } else {
        image.names.iter().map(|n| split_name(n)).collect()
    };

    names
        .into_iter()
        .map(|(repository, tag)| vec![repository, tag, id.clone(), created.clone(), size.clone()])
        .collect()
}

fn split_name(name: &str) -> (String, String) {
    match ImageReference::parse(name) {
        Ok(r) => (
            format!("{}/{}", r.registry, r.repository),
            r.tag.unwrap_or_else(|| "<none>".to_string()),
        ),
        Err(_) => (name.to_string(), "<none>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn image(names: &[&str]) -> StoredImage {
        StoredImage {
            id: "0123456789abcdef0123".to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
            created: Utc::now(),
            created_by: String::new(),
            container_id: String::new(),
            size_bytes: 2048,
        }
    }

    #[test]
    fn test_rows_per_name() {
        let rows = rows(&image(&[
            "docker.io/library/alpine:latest",
            "localhost:5000/app:v1",
        ]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "docker.io/library/alpine");
        assert_eq!(rows[0][1], "latest");
        assert_eq!(rows[0][2], "0123456789ab");
        assert_eq!(rows[1][0], "localhost:5000/app");
        assert_eq!(rows[1][1], "v1");
        assert_eq!(rows[1][4], "2.0 KB");
    }

    #[test]
    fn test_untagged_row() {
        let rows = rows(&image(&[]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "<none>");
        assert_eq!(rows[0][1], "<none>");
    }
}
