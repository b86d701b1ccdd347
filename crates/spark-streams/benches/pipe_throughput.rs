use criterion::{Criterion, black_box};
use spark_streams::runtime::block_on;
use spark_streams::{
    Completion, PipeOptions, ReadableStream, TransformStream, UnderlyingSink, WritableStream,
    WritableStreamDefaultController,
};
use std::cell::Cell;
use std::rc::Rc;
use std::{env, time::Duration};

const CHUNKS: u64 = 1024;

/// 管道吞吐基准：衡量值在“可读流 -> (转换流) -> 可写流”之间搬运的调度成本。
///
/// # 设计背景（Why）
/// - 每个值都要经过读取请求、写入排队与下游完成三次异步交接，调度器与完成对象的开销会直接
///   体现在这里，适合作为回归基线。
///
/// # 逻辑解析（How）
/// - `pipe_direct`：迭代器来源直接管道到计数下游；
/// - `pipe_through_identity`：中间插入一个原样转发的转换流，观察额外一跳的成本。
fn bench_pipe(c: &mut Criterion) {
    c.bench_function("pipe_direct", |b| {
        b.iter(|| {
            let counter = Rc::new(Cell::new(0_u64));
            let source = ReadableStream::from_iter(0..CHUNKS);
            let dest = WritableStream::new(CountingSink(Rc::clone(&counter))).unwrap();
            block_on(source.pipe_to(&dest, PipeOptions::default())).unwrap();
            black_box(counter.get())
        });
    });

    c.bench_function("pipe_through_identity", |b| {
        b.iter(|| {
            let counter = Rc::new(Cell::new(0_u64));
            let source = ReadableStream::from_iter(0..CHUNKS);
            let identity = TransformStream::<u64, u64>::identity().unwrap();
            let readable = source
                .pipe_through(&identity, PipeOptions::default())
                .unwrap();
            let dest = WritableStream::new(CountingSink(Rc::clone(&counter))).unwrap();
            block_on(readable.pipe_to(&dest, PipeOptions::default())).unwrap();
            black_box(counter.get())
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_pipe(&mut criterion);
    criterion.final_summary();
}

struct CountingSink(Rc<Cell<u64>>);

impl UnderlyingSink<u64> for CountingSink {
    fn write(&mut self, chunk: u64, _controller: &WritableStreamDefaultController<u64>) -> Completion {
        self.0.set(self.0.get() + black_box(chunk) % 2);
        Box::pin(async { Ok(()) })
    }
}
