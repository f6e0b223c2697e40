use anyhow::Result;
use candle_core::{Device, Tensor};
use embedding::{AdaptiveEmbedding, AdaptiveEmbeddingConfig};

fn example_table() -> Result<AdaptiveEmbedding> {
    let config = AdaptiveEmbeddingConfig {
        n_token: 100,
        d_embed: 64,
        d_proj: 32,
        cutoffs: vec![20, 50],
        div_val: 4,
    };
    Ok(AdaptiveEmbedding::with_init(config, 0.02, &Device::Cpu)?)
}

#[test]
fn batch_routes_across_all_partitions() -> Result<()> {
    let table = example_table()?;
    let ids = Tensor::from_slice(&[5i64, 25, 75], (3, 1), &Device::Cpu)?;
    let out = table.forward(&ids)?;

    assert_eq!(out.dims(), &[3, 1, 32]);
    assert_eq!(table.partition_index(5)?, 0);
    assert_eq!(table.partition_index(25)?, 1);
    assert_eq!(table.partition_index(75)?, 2);

    // Every row must be non-trivial: the scatter may not leave a routed id
    // at its zero-filled initial value.
    let rows = out.reshape((3, 32))?.to_vec2::<f32>()?;
    for (index, row) in rows.iter().enumerate() {
        assert!(
            row.iter().any(|v| v.abs() > 0.0),
            "row {index} was left unfilled"
        );
    }
    Ok(())
}

#[test]
fn scatter_matches_direct_partition_lookup() -> Result<()> {
    let table = example_table()?;
    let scale = table.scale();

    // id 25 lives in partition 1 ([20, 50), local index 5). The scattered
    // output must equal the partition-local embedding, projected and
    // scaled, with no value alteration on the way through the scatter.
    let ids = Tensor::from_slice(&[5i64, 25, 75], (3, 1), &Device::Cpu)?;
    let out = table.forward(&ids)?;
    let via_scatter = out.narrow(0, 1, 1)?.flatten_all()?.to_vec1::<f32>()?;

    let local = Tensor::from_slice(&[5i64], 1, &Device::Cpu)?;
    let direct = table
        .partition_table(1)
        .unwrap()
        .index_select(&local, 0)?
        .matmul(table.partition_projection(1).unwrap())?
        .affine(scale, 0.0)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    assert_eq!(via_scatter.len(), 32);
    for (a, b) in via_scatter.iter().zip(&direct) {
        assert!((a - b).abs() < 1e-6);
    }
    assert!(scale > 0.0 && (scale - (32f64).sqrt()).abs() < 1e-12);
    Ok(())
}

#[test]
fn ids_at_vocab_boundary_are_rejected() -> Result<()> {
    let table = example_table()?;
    let ids = Tensor::from_slice(&[100i64], (1, 1), &Device::Cpu)?;
    let err = table.forward(&ids).unwrap_err();
    assert!(err.to_string().contains("100"));
    Ok(())
}
