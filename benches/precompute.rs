use bencher::{benchmark_group, benchmark_main, black_box, Bencher};

use cerulean::precompute::Schedule;

fn plan_order_4(b: &mut Bencher) {
    b.iter(|| Schedule::plan(black_box(4)));
}

fn plan_order_10(b: &mut Bencher) {
    b.iter(|| Schedule::plan(black_box(10)));
}

fn plan_order_32(b: &mut Bencher) {
    b.iter(|| Schedule::plan(black_box(32)));
}

benchmark_group!(benches, plan_order_4, plan_order_10, plan_order_32);
benchmark_main!(benches);
