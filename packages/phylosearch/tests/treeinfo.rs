mod common;

use approx::assert_relative_eq;
use common::{simulated_fasta, simulated_msa};
use eyre::Report;
use phylosearch::alignment::msa::PartitionedMsa;
use phylosearch::io::fasta::read_many_fasta_str;
use phylosearch::io::partition_file::parse_partitions;
use phylosearch::kernel::pruning::PruningKernel;
use phylosearch::load_balancer::balance;
use phylosearch::model::model::ParamFlags;
use phylosearch::parallel::ParallelContext;
use phylosearch::tree::random::random_tree;
use phylosearch::tree::tree::Tree;
use phylosearch::treeinfo::spr::{CutoffInfo, SprRoundParams};
use phylosearch::treeinfo::{BrlenLinkage, TreeInfo, TreeInfoOptions};
use phylosearch::utils::random::get_random_number_generator;
use rstest::rstest;

fn start_tree(msa: &PartitionedMsa) -> Result<Tree, Report> {
  let mut rng = get_random_number_generator(Some(3));
  random_tree(&msa.taxon_names, &mut rng)
}

/// Runs `f` on a tree-search state of every worker and returns the results in rank order
fn on_workers<R, F>(msa: &PartitionedMsa, num_workers: usize, options: &TreeInfoOptions, f: F) -> Result<Vec<R>, Report>
where
  R: Send,
  F: Fn(&mut TreeInfo) -> Result<R, Report> + Sync,
{
  let tree = start_tree(msa)?;
  let assignment = balance(&msa.site_costs(), num_workers)?;
  let models = msa.models();
  let weights = msa.original_weights();
  let ctx = ParallelContext::new(num_workers, msa.num_partitions())?;
  ctx.run(|worker| {
    let mut treeinfo = TreeInfo::new(
      worker,
      tree.clone(),
      msa,
      &models,
      assignment.worker(worker.rank()),
      &weights,
      &PruningKernel,
      options,
    )?;
    f(&mut treeinfo)
  })
}

fn two_partition_msa() -> Result<PartitionedMsa, Report> {
  let records = read_many_fasta_str(simulated_fasta(100, 0.08, 11))?;
  let definitions = parse_partitions("GTR+G, first = 1-60\nJC, second = 61-100\n")?;
  PartitionedMsa::from_records(&records, &definitions)
}

fn assert_same_on_all_workers(results: &[(f64, f64)]) {
  for result in results {
    assert_eq!(result, &results[0]);
  }
}

#[rstest]
#[case(1)]
#[case(2)]
fn branch_length_optimization_does_not_lose_likelihood(#[case] num_workers: usize) -> Result<(), Report> {
  let msa = simulated_msa(80, "GTR+G")?;
  let results = on_workers(&msa, num_workers, &TreeInfoOptions::default(), |treeinfo| {
    let before = treeinfo.loglh(false)?;
    let after = treeinfo.optimize_branch_lengths(0.01, 1)?;
    Ok((before, after))
  })?;

  assert_same_on_all_workers(&results);
  let (before, after) = results[0];
  assert!(after >= before - 1e-6, "{before} -> {after}");
  Ok(())
}

#[rstest]
#[case(1)]
#[case(2)]
fn model_optimization_does_not_lose_likelihood(#[case] num_workers: usize) -> Result<(), Report> {
  let msa = simulated_msa(80, "GTR+G")?;
  let results = on_workers(&msa, num_workers, &TreeInfoOptions::default(), |treeinfo| {
    let before = treeinfo.loglh(false)?;
    let after = treeinfo.optimize_parameters(ParamFlags::all(), false, 0.1)?;
    Ok((before, after))
  })?;

  assert_same_on_all_workers(&results);
  let (before, after) = results[0];
  assert!(after >= before - 1e-6, "{before} -> {after}");
  Ok(())
}

#[rstest]
#[case(1)]
#[case(2)]
fn incremental_evaluation_matches_full_evaluation(#[case] num_workers: usize) -> Result<(), Report> {
  let msa = simulated_msa(60, "GTR+G")?;
  let results = on_workers(&msa, num_workers, &TreeInfoOptions::default(), |treeinfo| {
    treeinfo.loglh(false)?;
    treeinfo.optimize_branch_lengths(0.1, 1)?;

    let params = SprRoundParams {
      radius_min: 1,
      radius_max: 3,
      keep_count: 5,
      thorough: false,
      subtree_cutoff: 1.0,
      lh_epsilon: 0.1,
    };
    let mut cutoff = CutoffInfo::new(treeinfo.loglh(true)?);
    treeinfo.spr_round(&params, &mut cutoff)?;

    let incremental = treeinfo.loglh(true)?;
    let full = treeinfo.loglh(false)?;
    Ok((incremental, full))
  })?;

  assert_same_on_all_workers(&results);
  let (incremental, full) = results[0];
  assert_relative_eq!(incremental, full, max_relative = 1e-10);
  Ok(())
}

#[rstest]
fn likelihood_does_not_depend_on_number_of_workers() -> Result<(), Report> {
  let msa = two_partition_msa()?;
  let evaluate = |num_workers| -> Result<f64, Report> {
    let results = on_workers(&msa, num_workers, &TreeInfoOptions::default(), |treeinfo| treeinfo.loglh(false))?;
    Ok(results[0])
  };

  let single = evaluate(1)?;
  for num_workers in [2, 3] {
    assert_relative_eq!(evaluate(num_workers)?, single, max_relative = 1e-10);
  }
  Ok(())
}

#[rstest]
#[case::lewis("GTR+ASC_LEWIS", "GTR")]
#[case::felsenstein("GTR+G+ASC_FELS{50}", "GTR+G")]
fn ascertainment_correction_does_not_depend_on_number_of_workers(
  #[case] model: &str,
  #[case] uncorrected_model: &str,
) -> Result<(), Report> {
  let evaluate = |model: &str, num_workers| -> Result<f64, Report> {
    let msa = simulated_msa(120, model)?;
    let results = on_workers(&msa, num_workers, &TreeInfoOptions::default(), |treeinfo| treeinfo.loglh(false))?;
    Ok(results[0])
  };

  let single = evaluate(model, 1)?;
  assert!((single - evaluate(uncorrected_model, 1)?).abs() > 1e-3);
  for num_workers in [2, 4] {
    assert_relative_eq!(evaluate(model, num_workers)?, single, max_relative = 1e-10);
  }
  Ok(())
}

#[rstest]
#[case(1)]
#[case(2)]
fn scaled_branch_lengths_keep_unit_mean_scaler(#[case] num_workers: usize) -> Result<(), Report> {
  let msa = two_partition_msa()?;
  let options = TreeInfoOptions {
    linkage: BrlenLinkage::Scaled,
    optimize_model: true,
  };
  let results = on_workers(&msa, num_workers, &options, |treeinfo| {
    let before = treeinfo.loglh(false)?;
    let after = treeinfo.optimize_branch_lengths(0.1, 1)?;
    let scalers = treeinfo.models().iter().map(|model| model.brlen_scaler).collect::<Vec<_>>();
    Ok((before, after, scalers))
  })?;

  for result in &results {
    assert_eq!(result, &results[0]);
  }
  let (before, after, scalers) = &results[0];
  assert!(after >= &(before - 1e-6), "{before} -> {after}");

  let sites = msa.partitions.iter().map(|p| p.msa.num_sites() as f64).collect::<Vec<_>>();
  let mean = scalers.iter().zip(&sites).map(|(s, n)| s * n).sum::<f64>() / sites.iter().sum::<f64>();
  assert_relative_eq!(mean, 1.0, max_relative = 1e-9);
  Ok(())
}
