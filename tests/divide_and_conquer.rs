//! Recursive self-hosting: divide-and-conquer algorithms that re-dispatch
//! themselves into child pools from inside their own workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use futures::StreamExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use forkpool::recursive::root_task;
use forkpool::{
    Capabilities, DivideAndConquer, OperatorRegistry, Pool, RecursiveOperator, TaskOutcome,
    TaskQueue,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// ==================== Strategies ====================

#[derive(Debug, Serialize, Deserialize)]
struct SortParams {
    threshold: usize,
}

struct MergeSort;

impl DivideAndConquer for MergeSort {
    const NAME: &'static str = "merge_sort";
    type Params = SortParams;
    type Payload = Vec<i64>;
    type Output = Vec<i64>;

    fn is_base_case(&self, params: &SortParams, payload: &Vec<i64>) -> bool {
        payload.len() <= params.threshold.max(1)
    }

    fn solve(&self, _params: &SortParams, mut payload: Vec<i64>) -> Result<Vec<i64>, String> {
        payload.sort_unstable();
        Ok(payload)
    }

    fn split(&self, _params: &SortParams, payload: &Vec<i64>) -> Result<Vec<Vec<i64>>, String> {
        let (left, right) = payload.split_at(payload.len() / 2);
        Ok(vec![left.to_vec(), right.to_vec()])
    }

    fn combine(
        &self,
        _params: &SortParams,
        _payload: Vec<i64>,
        parts: Vec<Vec<i64>>,
    ) -> Result<Vec<i64>, String> {
        let [left, right] = <[Vec<i64>; 2]>::try_from(parts)
            .map_err(|parts| format!("expected two halves, got {}", parts.len()))?;

        let mut merged = Vec::with_capacity(left.len() + right.len());
        let (mut l, mut r) = (left.into_iter().peekable(), right.into_iter().peekable());
        while let (Some(a), Some(b)) = (l.peek(), r.peek()) {
            if a <= b {
                merged.extend(l.next());
            } else {
                merged.extend(r.next());
            }
        }
        merged.extend(l);
        merged.extend(r);
        Ok(merged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    value: i64,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Stats {
    sum: i64,
    count: u64,
    max: i64,
    min: i64,
}

impl Stats {
    fn single(value: i64) -> Self {
        Self {
            sum: value,
            count: 1,
            max: value,
            min: value,
        }
    }

    fn merge(self, other: Stats) -> Self {
        Self {
            sum: self.sum + other.sum,
            count: self.count + other.count,
            max: self.max.max(other.max),
            min: self.min.min(other.min),
        }
    }
}

/// Sum, count, max and min over a binary tree, one worker per subtree.
struct TreeAggregate;

impl DivideAndConquer for TreeAggregate {
    const NAME: &'static str = "tree_aggregate";
    type Params = ();
    type Payload = Node;
    type Output = Stats;

    fn is_base_case(&self, _params: &(), node: &Node) -> bool {
        node.left.is_none() && node.right.is_none()
    }

    fn solve(&self, _params: &(), node: Node) -> Result<Stats, String> {
        Ok(Stats::single(node.value))
    }

    fn split(&self, _params: &(), node: &Node) -> Result<Vec<Node>, String> {
        Ok([&node.left, &node.right]
            .into_iter()
            .flatten()
            .map(|child| (**child).clone())
            .collect())
    }

    fn combine(&self, _params: &(), node: Node, parts: Vec<Stats>) -> Result<Stats, String> {
        Ok(parts.into_iter().fold(Stats::single(node.value), Stats::merge))
    }
}

type Matrix = Vec<Vec<f64>>;

#[derive(Debug, Serialize, Deserialize)]
struct BlockParams {
    leaf: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    a: Matrix,
    b: Matrix,
}

/// Square block matrix multiplication with eight sub-products per level.
struct BlockMultiply;

impl DivideAndConquer for BlockMultiply {
    const NAME: &'static str = "block_multiply";
    type Params = BlockParams;
    type Payload = Product;
    type Output = Matrix;

    fn is_base_case(&self, params: &BlockParams, product: &Product) -> bool {
        let n = product.a.len();
        n <= params.leaf.max(1) || n % 2 == 1
    }

    fn solve(&self, _params: &BlockParams, product: Product) -> Result<Matrix, String> {
        Ok(dense_multiply(&product.a, &product.b))
    }

    fn split(&self, _params: &BlockParams, product: &Product) -> Result<Vec<Product>, String> {
        let [a11, a12, a21, a22] = quadrants(&product.a);
        let [b11, b12, b21, b22] = quadrants(&product.b);
        let pair = |a: &Matrix, b: &Matrix| Product {
            a: a.clone(),
            b: b.clone(),
        };
        Ok(vec![
            pair(&a11, &b11),
            pair(&a12, &b21),
            pair(&a11, &b12),
            pair(&a12, &b22),
            pair(&a21, &b11),
            pair(&a22, &b21),
            pair(&a21, &b12),
            pair(&a22, &b22),
        ])
    }

    fn combine(
        &self,
        _params: &BlockParams,
        _product: Product,
        parts: Vec<Matrix>,
    ) -> Result<Matrix, String> {
        let [p0, p1, p2, p3, p4, p5, p6, p7] = <[Matrix; 8]>::try_from(parts)
            .map_err(|parts| format!("expected eight block products, got {}", parts.len()))?;
        Ok(assemble(
            add(&p0, &p1),
            add(&p2, &p3),
            add(&p4, &p5),
            add(&p6, &p7),
        ))
    }
}

/// Sums leaves; a negative leaf fails.
struct FragileSum;

impl DivideAndConquer for FragileSum {
    const NAME: &'static str = "fragile_sum";
    type Params = ();
    type Payload = Vec<i64>;
    type Output = i64;

    fn is_base_case(&self, _params: &(), payload: &Vec<i64>) -> bool {
        payload.len() <= 1
    }

    fn solve(&self, _params: &(), payload: Vec<i64>) -> Result<i64, String> {
        match payload.first() {
            Some(v) if *v < 0 => Err(format!("negative leaf {v}")),
            Some(v) => Ok(*v),
            None => Ok(0),
        }
    }

    fn split(&self, _params: &(), payload: &Vec<i64>) -> Result<Vec<Vec<i64>>, String> {
        Ok(payload.iter().map(|v| vec![*v]).collect())
    }

    fn combine(&self, _params: &(), _payload: Vec<i64>, parts: Vec<i64>) -> Result<i64, String> {
        Ok(parts.into_iter().sum())
    }
}

/// Leaves block their thread for a while before answering.
struct SlowSum;

impl DivideAndConquer for SlowSum {
    const NAME: &'static str = "slow_sum";
    type Params = ();
    type Payload = Vec<i64>;
    type Output = i64;

    fn is_base_case(&self, _params: &(), payload: &Vec<i64>) -> bool {
        payload.len() <= 1
    }

    fn solve(&self, _params: &(), payload: Vec<i64>) -> Result<i64, String> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(payload.into_iter().sum())
    }

    fn split(&self, _params: &(), payload: &Vec<i64>) -> Result<Vec<Vec<i64>>, String> {
        Ok(payload.iter().map(|v| vec![*v]).collect())
    }

    fn combine(&self, _params: &(), _payload: Vec<i64>, parts: Vec<i64>) -> Result<i64, String> {
        Ok(parts.into_iter().sum())
    }
}

// ==================== Helpers ====================

fn capabilities() -> Capabilities {
    forkpool::telemetry::init_tracing();
    let registry = OperatorRegistry::with_builtins()
        .with(Arc::new(RecursiveOperator::new(MergeSort)))
        .with(Arc::new(RecursiveOperator::new(TreeAggregate)))
        .with(Arc::new(RecursiveOperator::new(BlockMultiply)))
        .with(Arc::new(RecursiveOperator::new(FragileSum)))
        .with(Arc::new(RecursiveOperator::new(SlowSum)));
    Capabilities::new(registry)
}

/// Run one recursive root task and decode its single output.
async fn run_root<D, P>(params: &P, payload: D::Payload) -> anyhow::Result<D::Output>
where
    D: DivideAndConquer,
    D::Output: DeserializeOwned,
    P: Serialize,
{
    let program = RecursiveOperator::<D>::computation(params)?;
    let mut queue = TaskQueue::new("root");
    queue.enqueue(root_task(program, payload)?);

    let mut pool = Pool::new(vec![queue], capabilities())?;
    let results = pool.start().context("root pool had nothing to run")?;
    let outcomes = timeout(TEST_TIMEOUT, results.collect_outcomes()).await?;

    let [outcome] = <[TaskOutcome; 1]>::try_from(outcomes)
        .map_err(|o| anyhow!("expected one root outcome, got {}", o.len()))?;
    if let Some(error) = outcome.error {
        bail!(error);
    }
    let value = outcome
        .values
        .into_iter()
        .next()
        .context("root emitted no value")?;
    Ok(serde_json::from_value(value)?)
}

fn balanced(values: &[i64]) -> Option<Box<Node>> {
    if values.is_empty() {
        return None;
    }
    let mid = values.len() / 2;
    Some(Box::new(Node {
        value: values[mid],
        left: balanced(&values[..mid]),
        right: balanced(&values[mid + 1..]),
    }))
}

fn traverse(node: &Node) -> Stats {
    [&node.left, &node.right]
        .into_iter()
        .flatten()
        .map(|child| traverse(child))
        .fold(Stats::single(node.value), Stats::merge)
}

fn dense_multiply(a: &Matrix, b: &Matrix) -> Matrix {
    let n = a.len();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| (0..n).map(|k| a[i][k] * b[k][j]).sum())
                .collect()
        })
        .collect()
}

fn quadrants(m: &Matrix) -> [Matrix; 4] {
    let h = m.len() / 2;
    let block = |rows: std::ops::Range<usize>, cols: std::ops::Range<usize>| -> Matrix {
        m[rows].iter().map(|row| row[cols.clone()].to_vec()).collect()
    };
    [
        block(0..h, 0..h),
        block(0..h, h..2 * h),
        block(h..2 * h, 0..h),
        block(h..2 * h, h..2 * h),
    ]
}

fn add(a: &Matrix, b: &Matrix) -> Matrix {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.iter().zip(y).map(|(p, q)| p + q).collect())
        .collect()
}

fn assemble(c11: Matrix, c12: Matrix, c21: Matrix, c22: Matrix) -> Matrix {
    let top = c11.into_iter().zip(c12).map(|(l, r)| [l, r].concat());
    let bottom = c21.into_iter().zip(c22).map(|(l, r)| [l, r].concat());
    top.chain(bottom).collect()
}

fn matrix(n: usize, seed: f64) -> Matrix {
    (0..n)
        .map(|i| (0..n).map(|j| seed + (i * n + j) as f64 * 0.5 - j as f64).collect())
        .collect()
}

fn assert_close(actual: &Matrix, expected: &Matrix) {
    assert_eq!(actual.len(), expected.len());
    for (row_a, row_e) in actual.iter().zip(expected) {
        for (a, e) in row_a.iter().zip(row_e) {
            assert!((a - e).abs() < 1e-9, "{a} != {e}");
        }
    }
}

// ==================== Tests ====================

#[tokio::test]
async fn tree_aggregate_matches_traversal() -> anyhow::Result<()> {
    let tree = *balanced(&[5, 3, 8, 1, 4]).context("empty tree")?;
    let expected = traverse(&tree);

    let stats = run_root::<TreeAggregate, _>(&(), tree).await?;

    assert_eq!(stats, expected);
    assert_eq!(
        stats,
        Stats {
            sum: 21,
            count: 5,
            max: 8,
            min: 1
        }
    );
    Ok(())
}

#[tokio::test]
async fn single_leaf_tree_is_solved_directly() -> anyhow::Result<()> {
    let leaf = Node {
        value: -7,
        left: None,
        right: None,
    };
    let stats = run_root::<TreeAggregate, _>(&(), leaf).await?;
    assert_eq!(stats, Stats::single(-7));
    Ok(())
}

#[tokio::test]
async fn merge_sort_for_every_threshold() -> anyhow::Result<()> {
    let input = vec![9, 2, 7, 4, 1, 8, 3];
    for threshold in 1..=input.len() {
        let sorted =
            run_root::<MergeSort, _>(&SortParams { threshold }, input.clone()).await?;
        assert_eq!(sorted, vec![1, 2, 3, 4, 7, 8, 9], "threshold {threshold}");
    }
    Ok(())
}

#[tokio::test]
async fn merge_sort_random_inputs() -> anyhow::Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..4 {
        let len = rng.gen_range(0..32);
        let threshold = rng.gen_range(1..6);
        let input: Vec<i64> = (0..len).map(|_| rng.gen_range(-100..100)).collect();

        let mut expected = input.clone();
        expected.sort();

        let sorted = run_root::<MergeSort, _>(&SortParams { threshold }, input).await?;
        assert_eq!(sorted, expected);
    }
    Ok(())
}

#[tokio::test]
async fn block_multiply_matches_dense() -> anyhow::Result<()> {
    let a = matrix(4, 1.0);
    let b = matrix(4, -2.5);
    let expected = dense_multiply(&a, &b);

    let product = run_root::<BlockMultiply, _>(&BlockParams { leaf: 2 }, Product { a, b }).await?;

    assert_close(&product, &expected);
    Ok(())
}

#[tokio::test]
async fn block_multiply_two_levels_deep() -> anyhow::Result<()> {
    let a = matrix(8, 0.25);
    let b = matrix(8, 3.0);
    let expected = dense_multiply(&a, &b);

    let product = run_root::<BlockMultiply, _>(&BlockParams { leaf: 2 }, Product { a, b }).await?;

    assert_close(&product, &expected);
    Ok(())
}

#[tokio::test]
async fn child_failure_fails_the_root() -> anyhow::Result<()> {
    let result = run_root::<FragileSum, _>(&(), vec![1, 2, -3, 4]).await;

    let error = result.expect_err("a negative leaf must fail the root").to_string();
    assert!(error.contains("negative leaf -3"), "{error}");
    assert!(error.contains("Child task 2"), "{error}");
    Ok(())
}

#[tokio::test]
async fn healthy_siblings_do_not_mask_failure() -> anyhow::Result<()> {
    assert_eq!(run_root::<FragileSum, _>(&(), vec![1, 2, 3, 4]).await?, 10);
    assert!(run_root::<FragileSum, _>(&(), vec![-1, 2, 3, 4]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn terminating_the_root_abandons_the_recursion() -> anyhow::Result<()> {
    let program = RecursiveOperator::<SlowSum>::computation(&())?;
    let mut queue = TaskQueue::new("root");
    queue.enqueue(root_task(program, vec![1_i64, 2, 3])?);

    let mut pool = Pool::new(vec![queue], capabilities())?;
    let mut results = pool.start().context("root pool had nothing to run")?;

    timeout(TEST_TIMEOUT, async {
        while pool.active_worker_count() < 1 {
            let _ = timeout(Duration::from_millis(10), results.next()).await;
        }
    })
    .await?;
    pool.terminate_all();

    let rest: Vec<_> = timeout(TEST_TIMEOUT, results.collect()).await?;
    assert!(rest.is_empty(), "{rest:?}");
    assert_eq!(pool.active_worker_count(), 0);
    Ok(())
}
