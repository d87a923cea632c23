// Commands
pub const CMD_GETVERSION: u8 = 0x00;
pub const CMD_SIMSTEP: u8 = 0x02;
pub const CMD_CLOSE: u8 = 0x7F;
pub const CMD_STOP: u8 = 0x12;
pub const CMD_RESUME: u8 = 0x19;

pub const CMD_GET_TL_VARIABLE: u8 = 0xa2;
pub const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
pub const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
pub const CMD_GET_ROUTE_VARIABLE: u8 = 0xa6;
pub const CMD_GET_POLYGON_VARIABLE: u8 = 0xa8;
pub const CMD_GET_SIM_VARIABLE: u8 = 0xab;

pub const CMD_SET_TL_VARIABLE: u8 = 0xc2;
pub const CMD_SET_LANE_VARIABLE: u8 = 0xc3;
pub const CMD_SET_VEHICLE_VARIABLE: u8 = 0xc4;
pub const CMD_SET_ROUTE_VARIABLE: u8 = 0xc6;
pub const CMD_SET_POLYGON_VARIABLE: u8 = 0xc8;
pub const CMD_SET_SIM_VARIABLE: u8 = 0xcb;

pub const CMD_SUBSCRIBE_TL_VARIABLE: u8 = 0xd2;
pub const CMD_SUBSCRIBE_LANE_VARIABLE: u8 = 0xd3;
pub const CMD_SUBSCRIBE_VEHICLE_VARIABLE: u8 = 0xd4;
pub const CMD_SUBSCRIBE_ROUTE_VARIABLE: u8 = 0xd6;
pub const CMD_SUBSCRIBE_POLYGON_VARIABLE: u8 = 0xd8;
pub const CMD_SUBSCRIBE_SIM_VARIABLE: u8 = 0xdb;

/// Offset from a subscribe command to its response command.
pub const SUBSCRIPTION_RESPONSE_OFFSET: u8 = 0x10;
/// Offset from a get command to its response command.
pub const GET_RESPONSE_OFFSET: u8 = 0x10;

// Result codes
pub const RTYPE_OK: u8 = 0x00;
pub const RTYPE_NOTIMPLEMENTED: u8 = 0x01;
pub const RTYPE_ERR: u8 = 0xFF;

// Data types
pub const POSITION_2D: u8 = 0x01;
pub const POSITION_3D: u8 = 0x03;
pub const TYPE_BOUNDINGBOX: u8 = 0x05;
pub const TYPE_POLYGON: u8 = 0x06;
pub const TYPE_UBYTE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_INTEGER: u8 = 0x09;
pub const TYPE_DOUBLE: u8 = 0x0B;
pub const TYPE_STRING: u8 = 0x0C;
pub const TYPE_STRINGLIST: u8 = 0x0E;
pub const TYPE_COMPOUND: u8 = 0x0F;
pub const TYPE_COLOR: u8 = 0x11;

// Generic variables
pub const ID_LIST: u8 = 0x00;

// Vehicle variables
pub const VAR_SPEED: u8 = 0x40;
pub const VAR_ANGLE: u8 = 0x43;
pub const VAR_VEHICLECLASS: u8 = 0x49;
pub const VAR_SHAPE: u8 = 0x4e;
pub const VAR_TYPE: u8 = 0x4f;
pub const VAR_ROAD_ID: u8 = 0x50;
pub const VAR_LANE_ID: u8 = 0x51;
pub const VAR_ROUTE_ID: u8 = 0x53;
pub const VAR_EDGES: u8 = 0x54;
pub const VAR_LANEPOSITION: u8 = 0x56;
pub const VAR_SIGNALS: u8 = 0x5b;
pub const VAR_SLOPE: u8 = 0x36;
pub const VAR_POSITION3D: u8 = 0x39;
pub const VAR_ROUTE_INDEX: u8 = 0x69;
pub const VAR_STOPSTATE: u8 = 0xb5;
pub const VAR_SPEEDSETMODE: u8 = 0xb3;
pub const VAR_MOVE_TO_XY: u8 = 0xb4;
pub const VAR_LANECHANGE_MODE: u8 = 0xb6;
pub const REMOVE: u8 = 0x81;
pub const ADD: u8 = 0x80;
pub const ADD_FULL: u8 = 0x85;

// Simulation variables
pub const VAR_TIME: u8 = 0x66;
pub const VAR_NET_BOUNDING_BOX: u8 = 0x7c;

// Traffic light variables
pub const TL_RED_YELLOW_GREEN_STATE: u8 = 0x20;
pub const TL_CURRENT_PHASE: u8 = 0x28;
pub const TL_CURRENT_PROGRAM: u8 = 0x29;
pub const TL_NEXT_SWITCH: u8 = 0x2d;

// Removal reasons
pub const REMOVE_VAPORIZED: u8 = 0x03;

/// Variables subscribed for every vehicle in the simulation.
pub const VEHICLE_SUBSCRIPTION_VARS: [u8; 13] = [
    VAR_ROAD_ID,
    VAR_LANE_ID,
    VAR_LANEPOSITION,
    VAR_SPEED,
    VAR_ROUTE_INDEX,
    VAR_EDGES,
    VAR_POSITION3D,
    VAR_ANGLE,
    VAR_SIGNALS,
    VAR_ROUTE_ID,
    VAR_VEHICLECLASS,
    VAR_SLOPE,
    VAR_STOPSTATE,
];

pub const TRAFFICLIGHT_SUBSCRIPTION_VARS: [u8; 4] = [
    TL_CURRENT_PHASE,
    TL_CURRENT_PROGRAM,
    TL_NEXT_SWITCH,
    TL_RED_YELLOW_GREEN_STATE,
];
