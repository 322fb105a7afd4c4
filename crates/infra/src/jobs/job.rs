//! The `Job` trait and its in-memory instance.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use jobline_core::payload::empty_object;
use jobline_core::{
    DomainError, DomainResult, JobId, JobStatus, NewJob, NextJobInputs, Payload, SchemaKind,
};

use super::registry::Registry;
use crate::store::JobStore;

/// What a running job can reach besides its own payloads.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<Registry>,
}

impl RunContext {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }
}

/// A unit of work, registered by name.
///
/// `Inputs` and `Outputs` are either concrete [`Payload`]s or
/// [`NoSchema`](jobline_core::NoSchema). `run` mutates the instance: it sets
/// `outputs` and, for chained jobs, the next job's inputs. Outputs set before an
/// error are still persisted.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stored in the `name` column; unique per registry.
    const NAME: &'static str;

    type Inputs: Payload;
    type Outputs: Payload;

    async fn run(&self, job: &mut JobInstance<Self>, ctx: &RunContext) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        let _ = (job, ctx);
        Err(DomainError::NotImplemented(Self::NAME.to_string()).into())
    }
}

/// Schema capability of `J`, known at compile time.
pub const fn schema_of<J: Job>() -> SchemaKind {
    SchemaKind::of::<J::Inputs, J::Outputs>()
}

/// One job's typed payloads and lifecycle state.
pub struct JobInstance<J: Job> {
    pub inputs: Option<J::Inputs>,
    pub outputs: Option<J::Outputs>,
    pub status: JobStatus,
    /// Predecessor in a pipeline chain.
    pub previous_job: Option<JobId>,
    /// Backing row, once persisted.
    pub record: Option<JobId>,
    next_job_inputs: NextJobInputs,
}

impl<J: Job> JobInstance<J> {
    /// Build an instance.
    ///
    /// Fails if `J` declares an inputs schema and `inputs` is `None`, unless
    /// `check_inputs` is `false` (chained jobs whose inputs arrive later).
    pub fn create(
        inputs: Option<J::Inputs>,
        outputs: Option<J::Outputs>,
        status: JobStatus,
        check_inputs: bool,
    ) -> DomainResult<Self> {
        if check_inputs && J::Inputs::DECLARED && inputs.is_none() {
            return Err(DomainError::missing_inputs(J::NAME));
        }

        Ok(Self {
            inputs,
            outputs,
            status,
            previous_job: None,
            record: None,
            next_job_inputs: NextJobInputs::None,
        })
    }

    /// A `New` instance with checked inputs.
    pub fn new(inputs: Option<J::Inputs>) -> DomainResult<Self> {
        Self::create(inputs, None, JobStatus::New, true)
    }

    pub fn after(mut self, previous_job: Option<JobId>) -> Self {
        self.previous_job = previous_job;
        self
    }

    pub fn name(&self) -> &'static str {
        J::NAME
    }

    pub fn inputs_asdict(&self) -> DomainResult<JsonValue> {
        payload_asdict::<J::Inputs>(J::NAME, self.inputs.as_ref(), "inputs")
    }

    pub fn outputs_asdict(&self) -> DomainResult<JsonValue> {
        payload_asdict::<J::Outputs>(J::NAME, self.outputs.as_ref(), "outputs")
    }

    /// `{}` when unset, the single value, or an array with one element per
    /// successor.
    pub fn next_job_inputs_asdict(&self) -> JsonValue {
        self.next_job_inputs.as_value()
    }

    pub fn next_job_inputs(&self) -> &NextJobInputs {
        &self.next_job_inputs
    }

    /// Inputs for the single successor, replacing anything set before.
    pub fn set_next_job_inputs<T: Payload>(&mut self, inputs: &T) -> DomainResult<()> {
        self.next_job_inputs = NextJobInputs::One(inputs.to_value()?);
        Ok(())
    }

    /// Inputs for one more successor. Each pushed value yields its own row.
    pub fn push_next_job_inputs<T: Payload>(&mut self, inputs: &T) -> DomainResult<()> {
        let value = inputs.to_value()?;
        self.next_job_inputs = match std::mem::take(&mut self.next_job_inputs) {
            NextJobInputs::None => NextJobInputs::Many(vec![value]),
            NextJobInputs::One(first) => NextJobInputs::Many(vec![first, value]),
            NextJobInputs::Many(mut values) => {
                values.push(value);
                NextJobInputs::Many(values)
            }
        };
        Ok(())
    }

    /// Row to insert for this instance.
    pub fn to_new_job(&self) -> DomainResult<NewJob> {
        let inputs = self.inputs.as_ref().map(Payload::to_value).transpose()?;
        let outputs = self.outputs.as_ref().map(Payload::to_value).transpose()?;
        Ok(NewJob::new(J::NAME, self.status)
            .with_inputs(inputs)
            .with_outputs(outputs)
            .after(self.previous_job))
    }
}

fn payload_asdict<P: Payload>(
    job: &str,
    value: Option<&P>,
    kind: &'static str,
) -> DomainResult<JsonValue> {
    match value {
        None => Ok(empty_object()),
        Some(_) if !P::DECLARED => Err(DomainError::UndeclaredSchema {
            job: job.to_string(),
            kind,
        }),
        Some(value) => value.to_value(),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use jobline_core::NoSchema;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
    }
    impl Payload for Order {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Total {
        cents: i64,
    }
    impl Payload for Total {}

    /// Custom stored form: a bare number instead of an object.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Compact(u64);
    impl Payload for Compact {
        fn to_value(&self) -> DomainResult<JsonValue> {
            Ok(json!(self.0))
        }
    }

    struct PriceOrder;
    #[async_trait]
    impl Job for PriceOrder {
        const NAME: &'static str = "PriceOrder";
        type Inputs = Order;
        type Outputs = Total;
    }

    struct Tick;
    #[async_trait]
    impl Job for Tick {
        const NAME: &'static str = "Tick";
        type Inputs = NoSchema;
        type Outputs = NoSchema;
    }

    #[test]
    fn declared_inputs_are_required() {
        let err = JobInstance::<PriceOrder>::new(None).err().unwrap();
        assert_eq!(err, DomainError::missing_inputs("PriceOrder"));

        let unchecked = JobInstance::<PriceOrder>::create(None, None, JobStatus::NotReady, false);
        assert!(unchecked.is_ok());
    }

    #[test]
    fn jobs_without_schema_need_no_inputs() {
        let job = JobInstance::<Tick>::new(None).unwrap();
        assert_eq!(job.inputs_asdict().unwrap(), json!({}));
        assert_eq!(job.outputs_asdict().unwrap(), json!({}));
        assert_eq!(schema_of::<Tick>(), SchemaKind::None);
        assert_eq!(schema_of::<PriceOrder>(), SchemaKind::Both);
    }

    #[test]
    fn payloads_serialize_through_their_hook() {
        let mut job = JobInstance::<PriceOrder>::new(Some(Order { id: 1 })).unwrap();
        job.outputs = Some(Total { cents: 250 });

        assert_eq!(job.inputs_asdict().unwrap(), json!({ "id": 1 }));
        assert_eq!(job.outputs_asdict().unwrap(), json!({ "cents": 250 }));
    }

    #[test]
    fn next_job_inputs_support_fan_out() {
        let mut job = JobInstance::<PriceOrder>::new(Some(Order { id: 1 })).unwrap();
        assert_eq!(job.next_job_inputs_asdict(), json!({}));

        job.set_next_job_inputs(&Order { id: 2 }).unwrap();
        assert_eq!(job.next_job_inputs_asdict(), json!({ "id": 2 }));

        job.push_next_job_inputs(&Compact(3)).unwrap();
        assert_eq!(job.next_job_inputs_asdict(), json!([{ "id": 2 }, 3]));
    }

    #[test]
    fn to_new_job_carries_the_chain_link() {
        let previous = JobId::new();
        let job = JobInstance::<PriceOrder>::new(Some(Order { id: 9 }))
            .unwrap()
            .after(Some(previous));

        let row = job.to_new_job().unwrap();
        assert_eq!(row.name, "PriceOrder");
        assert_eq!(row.status, JobStatus::New);
        assert_eq!(row.previous_job, Some(previous));
        assert_eq!(row.inputs, Some(json!({ "id": 9 })));
        assert_eq!(row.outputs, None);
    }
}
