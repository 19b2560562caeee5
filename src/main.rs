use std::path::PathBuf;

use cl2d::synthetic::{bar, disc, population, ring, store_from};
use cl2d::{run_local_cluster, Cl2dConfig, Cl2dResult, InMemoryMetadata, JsonDirectoryWriter, MetadataTable};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Usage: `cl2d [config.json] [output dir]`
fn main() -> Cl2dResult<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Cl2dConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => Cl2dConfig {
            initial_classes: 1,
            final_classes: 3,
            max_shift: 4.0,
            ..Default::default()
        },
    };
    let out_dir = PathBuf::from(args.next().unwrap_or_else(|| "cl2d_out".to_string()));

    // Parameters for data generation
    let shape = (32, 32);
    let per_group = 40; // Images per shape
    let noise = 0.3; // Std. dev. of the added Gaussian noise
    let workers = 4;

    println!("Generating synthetic particles...");
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let groups = vec![
        population(&disc(shape, 5.0), per_group, noise, 2, &mut rng),
        population(&ring(shape, 8.0, 11.0), per_group, noise, 2, &mut rng),
        population(&bar(shape, 9, 2), per_group, noise, 2, &mut rng),
    ];
    let store = store_from(&groups);
    println!(
        "Number of Images: {}, Image Size: {}x{}, Workers: {}",
        store.len(),
        shape.0,
        shape.1,
        workers
    );

    println!("Starting CL2D classification...");
    let mut writer = JsonDirectoryWriter::new(&out_dir, "demo");
    let classification = run_local_cluster(&config, &store, workers, &mut writer, None)?;
    println!("Classification completed.");

    let mut metadata = InMemoryMetadata::new();
    classification.write_metadata(&mut metadata);
    let unclassified = metadata
        .ids()
        .into_iter()
        .filter(|&id| metadata.row(id).map_or(true, |row| row.enabled < 0))
        .count();

    println!("Class Assignment Counts:");
    for class in &classification.classes {
        // Ground truth group of each member, by image id.
        let mut by_group = vec![0usize; groups.len()];
        for member in &class.members {
            if let Some(id) = member.image {
                by_group[id.0 as usize / per_group] += 1;
            }
        }
        println!("Class {}: {} images, per shape {:?}", class.index, class.size, by_group);
    }
    println!("Unclassified: {}", unclassified);
    println!("Level outputs written to {}", out_dir.display());
    Ok(())
}
