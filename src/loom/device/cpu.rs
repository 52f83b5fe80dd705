use std::{
    any::TypeId,
    borrow::Cow,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    Backend as _, BackendOp, Buffer, Device, DeviceEvent, DeviceId, OpVTable, Storage, wave::Wave,
};
use crate::loom::{
    ops::{AccessError, ExportOp, ImportOp, TensorOp, TileId, check_io},
    platform,
    tag::Tag,
};

#[derive(Debug, Error)]
pub enum OpError {
    #[error("no kernel registered for op {0}")]
    Unknown(Cow<'static, str>),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("tile {0} is not registered")]
    Tile(Tag),
    #[error("tile {0} holds {1} bytes but the op declares {2}")]
    Size(Tag, usize, usize),
}

#[derive(Debug, Clone)]
pub struct Backend {
    /// Operators that the device is able to execute.
    ops: Arc<OpVTable<Self>>,
    /// Tile buffers by id.
    buffers: Arc<RwLock<HashMap<TileId, Buffer>>>,
}

impl super::Backend for Backend {
    #[inline]
    fn execute(&self, op: &dyn TensorOp) {
        match self.ops.get(&op.op_type()) {
            Some(f) => f(self, op),
            None => log::error!("unable to execute op of type {}", op.name()),
        }
    }

    #[inline]
    fn fetch(&self, id: TileId) -> Buffer {
        match self.buffers.read().expect("failed to lock").get(&id) {
            Some(buffer) => buffer.clone(),
            None => panic!("tile {} is not registered", id.get()),
        }
    }
}

impl Backend {
    fn register(&self, id: TileId, size: usize) {
        let buffer = Buffer::new(Storage::zeros(size));
        self.buffers
            .write()
            .expect("failed to lock")
            .insert(id, buffer);
    }

    fn unregister(&self, id: TileId) -> bool {
        self.buffers
            .write()
            .expect("failed to lock")
            .remove(&id)
            .is_some()
    }

    fn invalidate(&self, id: TileId) {
        if let Some(buffer) = self.buffers.read().expect("failed to lock").get(&id) {
            buffer.write().as_bytes_mut().fill(0);
        }
    }

    /// Checks that an op can run: a kernel exists, its io is well-formed and every tile is live.
    fn check(&self, op: &dyn TensorOp) -> Result<(), OpError> {
        if !self.ops.contains_key(&op.op_type()) {
            return Err(OpError::Unknown(op.name()));
        }
        let io = op.io();
        check_io(&io)?;
        let buffers = self.buffers.read().expect("failed to lock");
        for ir in &io {
            let Some(buffer) = buffers.get(&ir.id) else {
                return Err(OpError::Tile(ir.tag));
            };
            let size = buffer.read().size();
            if size != ir.data_size() {
                return Err(OpError::Size(ir.tag, size, ir.data_size()));
            }
        }
        Ok(())
    }

    /// Runs the members of a wave. They are independent, so they may run in parallel.
    fn run(&self, ops: Vec<Box<dyn TensorOp>>) {
        #[cfg(not(feature = "rayon"))]
        ops.iter().for_each(|op| self.execute(op.as_ref()));
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            ops.par_iter().for_each(|op| self.execute(op.as_ref()));
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicUsize,
    executed: AtomicUsize,
    rejected: AtomicUsize,
    invalidated: AtomicUsize,
    offload_hints: AtomicUsize,
    tiles: AtomicUsize,
}

/// A snapshot of what a [`Cpu`] device has seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Ops submitted from the caller's side.
    pub submitted: usize,
    /// Ops the runtime has run.
    pub executed: usize,
    /// Ops the runtime refused to run.
    pub rejected: usize,
    pub invalidated: usize,
    pub offload_hints: usize,
    /// Tiles currently registered.
    pub tiles: usize,
}

#[derive(Debug, Clone)]
pub struct Cpu {
    /// The unique identifier of the device.
    id: uid::Id<DeviceId>,
    /// Sends events to the serving backend.
    sender: flume::Sender<DeviceEvent>,
    counters: Arc<Counters>,
}

impl Device for Cpu {
    #[inline]
    fn execute(&self, event: DeviceEvent) {
        if let DeviceEvent::Submit { .. } = &event {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }
        _ = self.sender.send(event)
    }
}

impl PartialEq for Cpu {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Cpu {}

impl Cpu {
    pub fn stats(&self) -> Stats {
        let load = |x: &AtomicUsize| x.load(Ordering::Relaxed);
        let counters = self.counters.as_ref();
        Stats {
            submitted: load(&counters.submitted),
            executed: load(&counters.executed),
            rejected: load(&counters.rejected),
            invalidated: load(&counters.invalidated),
            offload_hints: load(&counters.offload_hints),
            tiles: load(&counters.tiles),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable<Backend>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn build(self) -> Cpu {
        let ops = self.add_op::<ImportOp>().add_op::<ExportOp>().ops;
        let ops = Arc::new(ops);
        let buffers = Arc::new(RwLock::new(HashMap::default()));
        let counters = Arc::new(Counters::default());

        let (sender, receiver) = flume::unbounded();
        let backend = Backend { ops, buffers };
        platform::spawn(serve(backend, receiver, counters.clone()));

        let id = uid::Id::new();
        Cpu {
            id,
            sender,
            counters,
        }
    }

    pub fn add_op<Op: BackendOp<Backend>>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        let f = |backend: &Backend, op: &dyn TensorOp| match op.downcast_ref::<Op>() {
            Some(op) => op.execute(backend),
            None => unreachable!(),
        };
        self.ops.insert(id, f);
        self
    }
}

impl BackendOp<Backend> for ImportOp {
    fn execute(&self, backend: &Backend) {
        let buffer = backend.fetch(self.op.io[0].id);
        buffer.write().as_bytes_mut().copy_from_slice(&self.contents);
    }
}

impl BackendOp<Backend> for ExportOp {
    fn execute(&self, backend: &Backend) {
        let buffer = backend.fetch(self.op.io[0].id);
        let contents = buffer.read().as_bytes().into();
        _ = self.sender.send(contents);
    }
}

async fn flush(backend: &Backend, wave: &mut Wave, counters: &Counters) {
    if wave.is_empty() {
        return;
    }
    log::trace!("run wave {wave}");
    let ops = wave.take();
    let count = ops.len();
    let backend = backend.clone();
    platform::handle(move || backend.run(ops)).await;
    counters.executed.fetch_add(count, Ordering::Relaxed);
}

async fn serve(backend: Backend, receiver: flume::Receiver<DeviceEvent>, counters: Arc<Counters>) {
    let mut wave = Wave::default();

    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Register { id, size } => {
                backend.register(id, size);
                counters.tiles.fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::Submit { op } => match backend.check(op.as_ref()) {
                Ok(()) => {
                    if wave.conflicts(&op.io()) {
                        flush(&backend, &mut wave, &counters).await;
                    }
                    wave.push(op);
                }
                Err(err) => {
                    #[cfg(feature = "strict")]
                    panic!("unable to execute op {}: {err}", op.name());
                    #[cfg(not(feature = "strict"))]
                    {
                        log::error!("unable to execute op {}: {err}", op.name());
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            DeviceEvent::Invalidate { id } => {
                if wave.touches(id) {
                    flush(&backend, &mut wave, &counters).await;
                }
                backend.invalidate(id);
                counters.invalidated.fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::WontUse { id } => {
                log::trace!("tile {} will not be used soon", id.get());
                counters.offload_hints.fetch_add(1, Ordering::Relaxed);
            }
            DeviceEvent::Unregister { id } => {
                if wave.touches(id) {
                    flush(&backend, &mut wave, &counters).await;
                }
                if backend.unregister(id) {
                    counters.tiles.fetch_sub(1, Ordering::Relaxed);
                }
            }
            DeviceEvent::Barrier { sender } => {
                flush(&backend, &mut wave, &counters).await;
                _ = sender.send_async(Ok(())).await;
            }
        }

        // nothing else is queued: run what has been collected
        if receiver.is_empty() {
            flush(&backend, &mut wave, &counters).await;
        }
    }

    flush(&backend, &mut wave, &counters).await;
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Backend, CpuBuilder};
    use crate::loom::{
        device::{Backend as _, BackendOp, Device, DeviceEvent},
        num::DataType,
        ops::{Access, InnerOp, TensorOp, TileId, TileIr},
        tag::Tag,
    };

    fn ir(id: TileId, access: Access) -> TileIr {
        TileIr {
            id,
            tag: Tag(id.get() as u64),
            r#type: DataType::F32,
            count: 1,
            node: 0,
            access,
        }
    }

    /// Adds one to a tile.
    #[derive(Debug, Clone, tessel_derive::TensorOp)]
    #[tensor_op(crate = "crate")]
    struct PhonyIncrementOp(InnerOp);

    impl BackendOp<Backend> for PhonyIncrementOp {
        fn execute(&self, backend: &Backend) {
            let buffer = backend.fetch(self.0.io[0].id);
            buffer.write().write_slice::<f32>()[0] += 1.0;
        }
    }

    /// Sends the value of a tile back.
    #[derive(Debug, Clone, tessel_derive::TensorOp)]
    #[tensor_op(crate = "crate", name = "phony_read")]
    struct PhonyReadOp {
        #[tensor_op]
        op: InnerOp,
        sender: flume::Sender<f32>,
    }

    impl BackendOp<Backend> for PhonyReadOp {
        fn execute(&self, backend: &Backend) {
            let buffer = backend.fetch(self.op.io[0].id);
            let value = buffer.read().read_slice::<f32>()[0];
            _ = self.sender.send(value);
        }
    }

    #[tokio::test]
    async fn test_ordering() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new()
            .add_op::<PhonyIncrementOp>()
            .add_op::<PhonyReadOp>()
            .build()
            .await;

        let tiles: Vec<_> = (0..4).map(|_| TileId::new()).collect();
        for &id in &tiles {
            cpu.execute(DeviceEvent::Register { id, size: 4 });
        }

        // increments of the same tile are serialized, different tiles are independent
        for (index, &id) in tiles.iter().enumerate() {
            for _ in 0..=index * 10 {
                let op = PhonyIncrementOp(InnerOp::new([ir(id, Access::ReadWrite)]));
                cpu.execute(DeviceEvent::Submit { op: Box::new(op) });
            }
        }

        let (sender, receiver) = flume::unbounded();
        for &id in &tiles {
            let op = InnerOp::new([ir(id, Access::ReadOnly)]);
            let sender = sender.clone();
            let op = PhonyReadOp { op, sender };
            assert_eq!(op.name(), "phony_read");
            cpu.execute(DeviceEvent::Submit { op: Box::new(op) });
        }
        cpu.wait_all().await?;

        // the reads are independent, so they may complete in any order
        let mut values: Vec<f32> = receiver.drain().collect();
        values.sort_by(f32::total_cmp);
        assert_eq!(values, vec![1.0, 11.0, 21.0, 31.0]);

        let stats = cpu.stats();
        assert_eq!(stats.submitted, 1 + 11 + 21 + 31 + 4);
        assert_eq!(stats.executed, stats.submitted);
        assert_eq!(stats.tiles, 4);

        for &id in &tiles {
            cpu.execute(DeviceEvent::Unregister { id });
        }
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new()
            .add_op::<PhonyIncrementOp>()
            .add_op::<PhonyReadOp>()
            .build()
            .await;

        let id = TileId::new();
        cpu.execute(DeviceEvent::Register { id, size: 4 });
        for _ in 0..3 {
            let op = PhonyIncrementOp(InnerOp::new([ir(id, Access::ReadWrite)]));
            cpu.execute(DeviceEvent::Submit { op: Box::new(op) });
        }
        cpu.execute(DeviceEvent::WontUse { id });
        cpu.execute(DeviceEvent::Invalidate { id });

        let (sender, receiver) = flume::bounded(1);
        let op = PhonyReadOp {
            op: InnerOp::new([ir(id, Access::ReadOnly)]),
            sender,
        };
        cpu.execute(DeviceEvent::Submit { op: Box::new(op) });

        // the increments finish before the contents are dropped
        assert_eq!(receiver.recv_async().await?, 0.0);

        cpu.wait_all().await?;
        let stats = cpu.stats();
        assert_eq!(stats.executed, 4);
        assert_eq!(stats.invalidated, 1);
        assert_eq!(stats.offload_hints, 1);

        Ok(())
    }
}
