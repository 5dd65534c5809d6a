//! Typed AST fragments produced by the parser (spec §4.2): `Program`,
//! `Policy`, `Application`, `Substance`, `Scenario`, `Command`, `Expr`, and
//! `YearMatcher`. The interpreter ([`crate::engine`]) walks these directly —
//! no separate lowering pass.

use rust_decimal::Decimal;

use crate::unit::Unit;

/// A parsed source file: the synthetic `"default"` policy plus any
/// user-defined policies, and the ordered list of scenarios to run.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub policies: Vec<Policy>,
    pub scenarios: Vec<Scenario>,
}

impl Program {
    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub applications: Vec<Application>,
}

#[derive(Debug, Clone)]
pub struct Application {
    pub name: String,
    pub substances: Vec<Substance>,
}

#[derive(Debug, Clone)]
pub struct Substance {
    pub name: String,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    /// Policy names in application order; `"default"` is always first and is
    /// inserted by the parser even if the source omits it.
    pub policies: Vec<String>,
    pub start_year: i32,
    pub end_year: i32,
    pub trials: u32,
}

/// A single sales/export/etc. channel, or the recycled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Manufacture,
    Import,
    Export,
    Recycle,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Manufacture => "manufacture",
            Channel::Import => "import",
            Channel::Export => "export",
            Channel::Recycle => "recycle",
        }
    }
}

/// Every stream the engine tracks or can be commanded to set (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Manufacture,
    Import,
    Export,
    Recycle,
    Sales,
    DomesticConsumption,
    ImportConsumption,
    ExportConsumption,
    RecycleConsumption,
    Consumption,
    Equipment,
    PriorEquipment,
    NewEquipment,
    RechargeEmissions,
    EolEmissions,
    Energy,
}

impl StreamKind {
    pub fn parse(raw: &str) -> Option<StreamKind> {
        match raw.trim().to_lowercase().as_str() {
            "manufacture" => Some(StreamKind::Manufacture),
            "import" => Some(StreamKind::Import),
            "export" => Some(StreamKind::Export),
            "recycle" => Some(StreamKind::Recycle),
            "sales" => Some(StreamKind::Sales),
            "domesticconsumption" => Some(StreamKind::DomesticConsumption),
            "importconsumption" => Some(StreamKind::ImportConsumption),
            "exportconsumption" => Some(StreamKind::ExportConsumption),
            "recycleconsumption" => Some(StreamKind::RecycleConsumption),
            "consumption" => Some(StreamKind::Consumption),
            "equipment" => Some(StreamKind::Equipment),
            "priorequipment" => Some(StreamKind::PriorEquipment),
            "newequipment" => Some(StreamKind::NewEquipment),
            "rechargeemissions" => Some(StreamKind::RechargeEmissions),
            "eolemissions" => Some(StreamKind::EolEmissions),
            "energy" => Some(StreamKind::Energy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Manufacture => "manufacture",
            StreamKind::Import => "import",
            StreamKind::Export => "export",
            StreamKind::Recycle => "recycle",
            StreamKind::Sales => "sales",
            StreamKind::DomesticConsumption => "domesticConsumption",
            StreamKind::ImportConsumption => "importConsumption",
            StreamKind::ExportConsumption => "exportConsumption",
            StreamKind::RecycleConsumption => "recycleConsumption",
            StreamKind::Consumption => "consumption",
            StreamKind::Equipment => "equipment",
            StreamKind::PriorEquipment => "priorEquipment",
            StreamKind::NewEquipment => "newEquipment",
            StreamKind::RechargeEmissions => "rechargeEmissions",
            StreamKind::EolEmissions => "eolEmissions",
            StreamKind::Energy => "energy",
        }
    }
}

/// `{ start?, end? }` year bound matcher (spec §3). `BEGIN`/`ONWARDS` resolve
/// to the simulation's bounds at match time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YearMatcher {
    pub start: Option<YearBound>,
    pub end: Option<YearBound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearBound {
    Value(i32),
    Begin,
    Onwards,
}

impl YearMatcher {
    pub fn all() -> Self {
        Self { start: None, end: None }
    }

    /// Does this matcher cover year `y`, given the simulation's `[sim_start, sim_end]`?
    pub fn matches(&self, y: i32, sim_start: i32, sim_end: i32) -> bool {
        let resolve = |b: YearBound| -> i32 {
            match b {
                YearBound::Value(v) => v,
                YearBound::Begin => sim_start,
                YearBound::Onwards => sim_end,
            }
        };
        let a = self.start.map(resolve).unwrap_or(sim_start);
        let b = self.end.map(resolve).unwrap_or(sim_end);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        y >= lo && y <= hi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Xor,
}

/// Expression AST, evaluated by the push-down machine ([`crate::pushdown`]).
#[derive(Debug, Clone)]
pub enum Expr {
    Number(Decimal),
    /// A literal with an attached unit, e.g. `5 kg`.
    UnitLiteral(Decimal, Unit),
    Var(String),
    YearsElapsed,
    YearAbsolute,
    Neg(Box<Expr>),
    BinOp(Box<Expr>, BinOp, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    Logical(Box<Expr>, LogicalOp, Box<Expr>),
    Ternary { cond: Box<Expr>, if_true: Box<Expr>, if_false: Box<Expr> },
    Limit { value: Box<Expr>, lo: Box<Expr>, hi: Box<Expr> },
    SampleUniform { lo: Box<Expr>, hi: Box<Expr> },
    SampleNormal { mean: Box<Expr>, std: Box<Expr> },
    Get { stream: StreamKind, of_substance: Option<String>, as_unit: Option<Unit> },
}

/// The command surface of spec §4.3. Every command except `define`/`get`
/// carries an optional [`YearMatcher`] gating when it runs.
#[derive(Debug, Clone)]
pub enum Command {
    Enable(Channel),
    InitialCharge { value: Expr, channel: Channel, during: YearMatcher },
    Equals { value: Expr, during: YearMatcher },
    Set { stream: StreamKind, value: Expr, during: YearMatcher },
    Change { stream: StreamKind, value: Expr, during: YearMatcher },
    Cap { stream: StreamKind, value: Expr, displacing: Option<String>, during: YearMatcher },
    Floor { stream: StreamKind, value: Expr, displacing: Option<String>, during: YearMatcher },
    Recharge { population_pct: Expr, intensity: Expr, during: YearMatcher },
    Retire { amount: Expr, during: YearMatcher },
    Recover { percent: Expr, reuse: Expr, displacing: Option<String>, during: YearMatcher },
    Replace { amount: Expr, from_stream: StreamKind, to_substance: String, during: YearMatcher },
    Define { name: String, expr: Expr },
}
