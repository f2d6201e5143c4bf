use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

/// Seeded generator for reproducible runs, or one seeded from system entropy
pub fn get_random_number_generator(seed: Option<u64>) -> Isaac64Rng {
  match seed {
    None => Isaac64Rng::from_entropy(),
    Some(seed) => Isaac64Rng::seed_from_u64(seed),
  }
}
