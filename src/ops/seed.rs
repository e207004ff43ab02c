//! Bulk catalog loading

use crate::common::{Error, Result};
use crate::coordinator::{Album, AlbumId, Coordinator, Price};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// On-disk catalog: a list of `[[albums]]` tables (TOML) or an
/// `{"albums": [...]}` object (JSON)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub albums: Vec<Album>,
}

#[derive(Debug, Default)]
pub struct SeedReport {
    pub inserted: usize,
}

/// Write every album and its ranking entry, one transaction per album
pub async fn seed_catalog<S: Store>(
    coordinator: &Coordinator<S>,
    albums: &[Album],
) -> Result<SeedReport> {
    tracing::info!("Seeding {} albums", albums.len());
    check_unique(albums)?;

    let mut report = SeedReport::default();
    for album in albums {
        coordinator.insert(album).await?;
        report.inserted += 1;
    }
    Ok(report)
}

/// Read a catalog file. `.json` files are JSON, anything else is TOML.
pub fn load_catalog_file(path: &Path) -> Result<Vec<Album>> {
    let text = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let catalog: CatalogFile = if is_json {
        serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?
    } else {
        toml::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?
    };
    check_unique(&catalog.albums)?;
    Ok(catalog.albums)
}

fn check_unique(albums: &[Album]) -> Result<()> {
    let mut seen = HashSet::new();
    for album in albums {
        if !seen.insert(album.id) {
            return Err(Error::InvalidConfig(format!(
                "album id {} appears more than once",
                album.id
            )));
        }
    }
    Ok(())
}

/// The four-album demo catalog
pub fn demo_catalog() -> Vec<Album> {
    let album = |id, title: &str, artist: &str, cents, likes| Album {
        id: AlbumId(id),
        title: title.to_string(),
        artist: artist.to_string(),
        price: Price::from_cents(cents),
        likes,
    };
    vec![
        album(1, "Electric Ladyland", "Jimi Hendrix", 495, 8),
        album(2, "Back in Black", "AC/DC", 595, 3),
        album(3, "Rumours", "Fleetwood Mac", 795, 12),
        album(4, "Nevermind", "Nirvana", 595, 8),
    ]
}
