use anyhow::{bail, ensure, Result};
use accelport_core::{
    ArgumentLifetime, DataLocation, Dimensions, ErrorStatus, OutputShape, RequestArgument, Timing,
};

/// One element of the request-channel datum stream. A packet is
/// `PacketInformation` followed by exactly the datums it announces:
/// input descriptors (each with its dimensions), output descriptors, pool
/// slot identifiers, and the measure-timing flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDatum {
    PacketInformation {
        /// Total datum count of the packet, this header included.
        packet_size: u32,
        num_inputs: u32,
        num_outputs: u32,
        num_pools: u32,
    },
    InputOperandInformation {
        has_no_value: bool,
        offset: u32,
        length: u32,
        num_dimensions: u32,
    },
    InputOperandDimension(u32),
    OutputOperandInformation {
        has_no_value: bool,
        offset: u32,
        length: u32,
        num_dimensions: u32,
    },
    OutputOperandDimension(u32),
    PoolIdentifier(u32),
    MeasureTiming(bool),
}

/// One element of the result-channel datum stream: `PacketInformation`,
/// per-output shape descriptors, then the timing datum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultDatum {
    PacketInformation {
        packet_size: u32,
        status: ErrorStatus,
        num_operands: u32,
    },
    OperandInformation {
        is_sufficient: bool,
        num_dimensions: u32,
    },
    OperandsDimension(u32),
    ExecutionTiming {
        time_on_device: u64,
        time_in_driver: u64,
    },
}

/// The argument portion of a burst request; pools travel as slot integers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BurstRequest {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
}

fn argument_datum_count(arg: &RequestArgument) -> usize {
    1 + arg.dimensions.rank()
}

/// Serializes a burst request into the request-channel datum stream.
pub fn serialize_request(request: &BurstRequest, slots: &[u32], measure: bool) -> Vec<RequestDatum> {
    let body: usize = request.inputs.iter().map(argument_datum_count).sum::<usize>()
        + request.outputs.iter().map(argument_datum_count).sum::<usize>()
        + slots.len()
        + 1; // measure flag
    let mut stream = Vec::with_capacity(body + 1);
    stream.push(RequestDatum::PacketInformation {
        packet_size: (body + 1) as u32,
        num_inputs: request.inputs.len() as u32,
        num_outputs: request.outputs.len() as u32,
        num_pools: slots.len() as u32,
    });
    for input in &request.inputs {
        stream.push(RequestDatum::InputOperandInformation {
            has_no_value: input.has_no_value(),
            offset: input.location.offset,
            length: input.location.length,
            num_dimensions: input.dimensions.rank() as u32,
        });
        for &dim in &input.dimensions.0 {
            stream.push(RequestDatum::InputOperandDimension(dim));
        }
    }
    for output in &request.outputs {
        stream.push(RequestDatum::OutputOperandInformation {
            has_no_value: output.has_no_value(),
            offset: output.location.offset,
            length: output.location.length,
            num_dimensions: output.dimensions.rank() as u32,
        });
        for &dim in &output.dimensions.0 {
            stream.push(RequestDatum::OutputOperandDimension(dim));
        }
    }
    for &slot in slots {
        stream.push(RequestDatum::PoolIdentifier(slot));
    }
    stream.push(RequestDatum::MeasureTiming(measure));
    stream
}

/// Parses a request-channel packet back into its fields. The stream must be
/// exactly one packet.
pub fn deserialize_request(stream: &[RequestDatum]) -> Result<(BurstRequest, Vec<u32>, bool)> {
    let mut iter = stream.iter().copied();
    let (packet_size, num_inputs, num_outputs, num_pools) = match iter.next() {
        Some(RequestDatum::PacketInformation {
            packet_size,
            num_inputs,
            num_outputs,
            num_pools,
        }) => (packet_size, num_inputs, num_outputs, num_pools),
        other => bail!("request packet must start with PacketInformation, got {other:?}"),
    };
    ensure!(
        packet_size as usize == stream.len(),
        "request packet size {} does not match stream length {}",
        packet_size,
        stream.len()
    );

    let mut read_argument = |is_input: bool| -> Result<RequestArgument> {
        let (has_no_value, offset, length, num_dimensions) = match (iter.next(), is_input) {
            (
                Some(RequestDatum::InputOperandInformation {
                    has_no_value,
                    offset,
                    length,
                    num_dimensions,
                }),
                true,
            )
            | (
                Some(RequestDatum::OutputOperandInformation {
                    has_no_value,
                    offset,
                    length,
                    num_dimensions,
                }),
                false,
            ) => (has_no_value, offset, length, num_dimensions),
            (other, _) => bail!("expected operand information datum, got {other:?}"),
        };
        let mut dims = Vec::with_capacity(num_dimensions as usize);
        for _ in 0..num_dimensions {
            match (iter.next(), is_input) {
                (Some(RequestDatum::InputOperandDimension(d)), true)
                | (Some(RequestDatum::OutputOperandDimension(d)), false) => dims.push(d),
                (other, _) => bail!("expected operand dimension datum, got {other:?}"),
            }
        }
        Ok(RequestArgument {
            lifetime: if has_no_value {
                ArgumentLifetime::NoValue
            } else {
                ArgumentLifetime::Pool
            },
            location: DataLocation {
                pool: 0,
                offset,
                length,
            },
            dimensions: Dimensions::from_slice(&dims),
        })
    };

    let inputs = (0..num_inputs)
        .map(|_| read_argument(true))
        .collect::<Result<Vec<_>>>()?;
    let outputs = (0..num_outputs)
        .map(|_| read_argument(false))
        .collect::<Result<Vec<_>>>()?;

    let mut slots = Vec::with_capacity(num_pools as usize);
    for _ in 0..num_pools {
        match iter.next() {
            Some(RequestDatum::PoolIdentifier(slot)) => slots.push(slot),
            other => bail!("expected pool identifier datum, got {other:?}"),
        }
    }
    let measure = match iter.next() {
        Some(RequestDatum::MeasureTiming(m)) => m,
        other => bail!("expected measure-timing datum, got {other:?}"),
    };
    ensure!(iter.next().is_none(), "trailing datums in request packet");

    Ok((BurstRequest { inputs, outputs }, slots, measure))
}

/// Serializes an execution result into the result-channel datum stream.
pub fn serialize_result(
    status: ErrorStatus,
    shapes: &[OutputShape],
    timing: Timing,
) -> Vec<ResultDatum> {
    let body: usize = shapes
        .iter()
        .map(|s| 1 + s.dimensions.rank())
        .sum::<usize>()
        + 1; // timing
    let mut stream = Vec::with_capacity(body + 1);
    stream.push(ResultDatum::PacketInformation {
        packet_size: (body + 1) as u32,
        status,
        num_operands: shapes.len() as u32,
    });
    for shape in shapes {
        stream.push(ResultDatum::OperandInformation {
            is_sufficient: shape.is_sufficient,
            num_dimensions: shape.dimensions.rank() as u32,
        });
        for &dim in &shape.dimensions.0 {
            stream.push(ResultDatum::OperandsDimension(dim));
        }
    }
    stream.push(ResultDatum::ExecutionTiming {
        time_on_device: timing.time_on_device,
        time_in_driver: timing.time_in_driver,
    });
    stream
}

/// Parses a result-channel packet.
pub fn deserialize_result(stream: &[ResultDatum]) -> Result<(ErrorStatus, Vec<OutputShape>, Timing)> {
    let mut iter = stream.iter().copied();
    let (packet_size, status, num_operands) = match iter.next() {
        Some(ResultDatum::PacketInformation {
            packet_size,
            status,
            num_operands,
        }) => (packet_size, status, num_operands),
        other => bail!("result packet must start with PacketInformation, got {other:?}"),
    };
    ensure!(
        packet_size as usize == stream.len(),
        "result packet size {} does not match stream length {}",
        packet_size,
        stream.len()
    );

    let mut shapes = Vec::with_capacity(num_operands as usize);
    for _ in 0..num_operands {
        let (is_sufficient, num_dimensions) = match iter.next() {
            Some(ResultDatum::OperandInformation {
                is_sufficient,
                num_dimensions,
            }) => (is_sufficient, num_dimensions),
            other => bail!("expected operand information datum, got {other:?}"),
        };
        let mut dims = Vec::with_capacity(num_dimensions as usize);
        for _ in 0..num_dimensions {
            match iter.next() {
                Some(ResultDatum::OperandsDimension(d)) => dims.push(d),
                other => bail!("expected operand dimension datum, got {other:?}"),
            }
        }
        shapes.push(OutputShape {
            dimensions: Dimensions::from_slice(&dims),
            is_sufficient,
        });
    }
    let timing = match iter.next() {
        Some(ResultDatum::ExecutionTiming {
            time_on_device,
            time_in_driver,
        }) => Timing {
            time_on_device,
            time_in_driver,
        },
        other => bail!("expected execution-timing datum, got {other:?}"),
    };
    ensure!(iter.next().is_none(), "trailing datums in result packet");

    Ok((status, shapes, timing))
}
